//! Coordinator events and the kernel error type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in the coordinator event log.
///
/// `event_type` is a dotted name such as `lease.acquired` or `dag.done`; `detail`
/// carries the structured context of the operation that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorEvent {
    pub event_type: String,
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
}

impl CoordinatorEvent {
    pub fn new(event_type: impl Into<String>, detail: Value) -> Self {
        Self {
            event_type: event_type.into(),
            detail,
            timestamp: Utc::now(),
        }
    }
}

/// Kernel-level error type.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serde(String),
    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        KernelError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Serde(err.to_string())
    }
}
