//! Lease stores, epoch fencing and the coordinator facade for swarm workers.

pub mod backend_config;
pub mod coordinator;
pub mod fence;
pub mod file_store;
pub mod lease;
pub mod models;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;
pub mod store;

pub use backend_config::{LeaseBackendKind, LeaseConfig};
pub use coordinator::{Coordinator, DagRunSummary, DagTransition};
pub use fence::{EpochFence, FenceCheck, FenceRole, FencedResult};
pub use file_store::FileLeaseStore;
pub use lease::{
    LeaseBackend, LeaseManager, StoreLeaseManager, DEFAULT_LEASE_TTL_SEC, FALLBACK_BACKEND,
};
pub use models::{
    AcquireResult, EpochToken, LeaseError, LeaseOutcome, LeaseRecord, LeaseSnapshot,
};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteLeaseStore;
pub use store::{InMemoryLeaseStore, LeaseStore, LeaseUpdate};
