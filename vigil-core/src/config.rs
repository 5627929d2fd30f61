use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs that tune the coordination components.
///
/// All fields carry defaults so deployments only need to supply the values
/// they want to change.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Per-subscriber queue sizing and delivery timeout for the notification bus.
    pub bus: BusConfig,
    /// Output sizing and advance jitter for round-robin rings.
    pub ring: RingConfig,
    /// Output sizing and check-in defaults for the presence coordinator.
    pub presence: PresenceConfig,
    /// Lock polling cadence for the synchronized executor.
    pub mutex: MutexConfig,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of each subscriber's private queue.
    pub queue_capacity: usize,
    /// How long the demux loop waits on a full subscriber queue before
    /// dropping the notification for that subscriber.
    pub delivery_timeout_ms: u64,
}

impl BusConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            delivery_timeout_ms: 60_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Capacity of each subscription's event stream.
    pub event_capacity: usize,
    /// Upper bound of the jitter subtracted from a scheduling interval when
    /// deciding whether the rotation is due, as a fraction of the interval.
    pub advance_jitter_ratio: f32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            event_capacity: 8,
            advance_jitter_ratio: 0.1,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Capacity of each monitor's batch stream.
    pub event_capacity: usize,
    /// Timeout applied by callers that do not choose their own.
    pub default_check_in_timeout_ms: u64,
}

impl PresenceConfig {
    pub fn default_check_in_timeout(&self) -> Duration {
        Duration::from_millis(self.default_check_in_timeout_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            event_capacity: 8,
            default_check_in_timeout_ms: 30_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MutexConfig {
    /// Retry cadence while waiting for a lock, and renewal cadence while
    /// holding one.
    pub check_in_interval_ms: u64,
}

impl MutexConfig {
    pub fn check_in_interval(&self) -> Duration {
        Duration::from_millis(self.check_in_interval_ms)
    }
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            check_in_interval_ms: 5_000,
        }
    }
}
