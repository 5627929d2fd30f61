//! Shared helpers for coordination integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::mpsc;
use vigil_core::bus::{NotificationBus, PgNotificationListener};
use vigil_core::config::{BusConfig, RingConfig};
use vigil_core::ring::{PostgresRing, RingEvent};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_bus(pool: &PgPool) -> Arc<NotificationBus> {
    start_bus_with(pool, BusConfig::default()).await
}

pub async fn start_bus_with(pool: &PgPool, config: BusConfig) -> Arc<NotificationBus> {
    let listener = PgNotificationListener::connect(pool, config.queue_capacity)
        .await
        .expect("listener connects");
    Arc::new(
        NotificationBus::start(Arc::new(listener), config)
            .await
            .expect("bus starts"),
    )
}

pub fn ring(pool: &PgPool, bus: &Arc<NotificationBus>, name: &str) -> PostgresRing {
    PostgresRing::new(
        pool.clone(),
        Arc::clone(bus),
        "default",
        name,
        RingConfig::default(),
    )
}

/// Next trigger window, failing the test on errors or silence.
pub async fn next_window(events: &mut mpsc::Receiver<RingEvent>) -> Vec<String> {
    match tokio::time::timeout(WAIT, events.recv()).await {
        Ok(Some(RingEvent::Trigger { values })) => values,
        Ok(Some(RingEvent::Error { message })) => panic!("ring error: {message}"),
        Ok(None) => panic!("ring stream closed"),
        Err(_) => panic!("no ring event within {WAIT:?}"),
    }
}

pub fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
