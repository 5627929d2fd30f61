//! Operator presence: liveness tracking and controller failover for
//! backends, agents and per-check schedulers.
//!
//! Operators check in periodically. An operator is live while it is marked
//! present and its last check-in is younger than its check-in timeout, as
//! measured by the database clock. Monitors poll for operators assigned to a
//! controller and move operators whose controller went silent over to a live
//! one.

mod postgres;

pub use postgres::PostgresOperatorPresence;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    Backend,
    Agent,
    Check,
}

impl OperatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorType::Backend => "backend",
            OperatorType::Agent => "agent",
            OperatorType::Check => "check",
        }
    }
}

impl fmt::Display for OperatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatorType {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backend" => Ok(OperatorType::Backend),
            "agent" => Ok(OperatorType::Agent),
            "check" => Ok(OperatorType::Check),
            other => Err(CoordError::NotValid(format!(
                "unknown operator type {other:?}"
            ))),
        }
    }
}

/// Identity of an operator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorKey {
    pub namespace: String,
    #[serde(rename = "type")]
    pub op_type: OperatorType,
    pub name: String,
}

impl OperatorKey {
    pub fn new(
        namespace: impl Into<String>,
        op_type: OperatorType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            op_type,
            name: name.into(),
        }
    }
}

impl fmt::Display for OperatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.op_type, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorState {
    #[serde(flatten)]
    pub key: OperatorKey,
    pub controller: Option<OperatorKey>,
    pub present: bool,
    /// Time of the last check-in, set by the database. Ignored on check-in.
    pub last_update: Option<DateTime<Utc>>,
    pub check_in_timeout: Duration,
    pub metadata: Option<serde_json::Value>,
}

impl OperatorState {
    /// A present operator with no controller.
    pub fn new(key: OperatorKey, check_in_timeout: Duration) -> Self {
        Self {
            key,
            controller: None,
            present: true,
            last_update: None,
            check_in_timeout,
            metadata: None,
        }
    }

    pub fn with_controller(mut self, controller: OperatorKey) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.name.trim().is_empty() {
            return Err(CoordError::NotValid("operator name must not be empty".into()));
        }
        if self.key.namespace.trim().is_empty() {
            return Err(CoordError::NotValid(format!(
                "operator {} must have a namespace",
                self.key.name
            )));
        }
        if self.check_in_timeout.as_millis() == 0 {
            return Err(CoordError::NotValid(format!(
                "operator {} check-in timeout must be at least 1ms",
                self.key
            )));
        }
        if self.controller.as_ref() == Some(&self.key) {
            return Err(CoordError::NotValid(format!(
                "operator {} cannot control itself",
                self.key
            )));
        }
        Ok(())
    }
}

/// Called with every monitor tick failure.
pub type ErrorHandler = Arc<dyn Fn(&CoordError) + Send + Sync>;

/// Which operators a monitor reports and who controls them.
#[derive(Clone)]
pub struct MonitorRequest {
    /// Type of the monitored operators.
    pub op_type: OperatorType,
    pub controller_type: OperatorType,
    pub controller_name: String,
    pub controller_namespace: String,
    pub every: Duration,
    /// Report every assigned operator on every tick, not only changed ones.
    pub micromanage: bool,
    /// Receives tick failures. Failures are logged when unset.
    pub error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for MonitorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorRequest")
            .field("op_type", &self.op_type)
            .field("controller_type", &self.controller_type)
            .field("controller_name", &self.controller_name)
            .field("controller_namespace", &self.controller_namespace)
            .field("every", &self.every)
            .field("micromanage", &self.micromanage)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl MonitorRequest {
    pub fn controller_key(&self) -> OperatorKey {
        OperatorKey::new(
            self.controller_namespace.clone(),
            self.controller_type,
            self.controller_name.clone(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.every.is_zero() {
            return Err(CoordError::NotValid(
                "monitor interval must be positive".into(),
            ));
        }
        if self.controller_name.trim().is_empty() {
            return Err(CoordError::NotValid(
                "monitor controller name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatorFilter {
    pub namespace: Option<String>,
    pub op_type: Option<OperatorType>,
}

#[async_trait]
pub trait OperatorPresence: Send + Sync {
    /// Create or refresh an operator.
    async fn check_in(&self, state: &OperatorState) -> Result<()>;

    async fn check_out(&self, key: &OperatorKey) -> Result<()>;

    async fn query_operator(&self, key: &OperatorKey) -> Result<OperatorState>;

    async fn list_operators(&self, filter: &OperatorFilter) -> Result<Vec<OperatorState>>;

    /// Start a monitor loop. Each tick yields the batch of operators assigned
    /// to the requested controller; the stream ends when `scope` ends.
    async fn monitor_operators(
        &self,
        scope: &CancellationToken,
        request: MonitorRequest,
    ) -> Result<mpsc::Receiver<Vec<OperatorState>>>;
}
