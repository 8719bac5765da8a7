//! Identity types for the swarm kernel.
//!
//! HolderId names a worker process competing for the lease; Epoch is the monotonic
//! leadership counter; NodeId names a work item in the execution DAG.

/// Identifies a worker process that may hold the coordination lease.
pub type HolderId = String;

/// Monotonically increasing leadership counter. Changes only when leadership changes.
pub type Epoch = u64;

/// Identifies a node (work item) in an execution DAG.
pub type NodeId = String;
