//! Swarm kernel API.
//!
//! Identity types, the kernel error, the bounded coordinator event log, and the
//! execution DAG with replay-safe progress snapshots.

pub mod dag;
pub mod event;
pub mod identity;
pub mod observer;
pub mod snapshot;

pub use dag::{CausalMetadata, DagNode, ExecutionDag, NodeStatus};
pub use event::{CoordinatorEvent, KernelError};
pub use identity::{Epoch, HolderId, NodeId};
pub use observer::{
    CoordinatorObserver, EventLogDocument, DEFAULT_MAX_EVENTS, EVENT_LOG_SCHEMA_VERSION,
};
pub use snapshot::{write_json_atomic, DagSnapshot, NodeProgress};
