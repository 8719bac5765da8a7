//! Process-local building blocks of the swarm coordination kernel.
//!
//! Everything in this crate is owned by a single process: the execution DAG and its
//! progress snapshots, and the coordinator event log. Cross-process coordination
//! (leases, fencing) lives in `swarm-execution-runtime`.

pub mod kernel;

pub use kernel::*;
