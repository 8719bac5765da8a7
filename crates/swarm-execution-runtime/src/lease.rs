//! Lease management: acquire, renew and release the coordination lease.
//!
//! [StoreLeaseManager] owns the epoch rules on top of any [LeaseStore]:
//! - the live holder calling again renews (epoch unchanged, expiry extended);
//! - an expired or unheld lease is acquired at `max(1, previous + 1)`;
//! - a live lease held by someone else leaves the caller a follower.
//!
//! [LeaseBackend] is what configuration produces. Besides a real store it can be a
//! labelled same-process fallback, or explicitly unavailable, in which case every call
//! answers in observer mode and never claims leadership.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use swarm_kernel::identity::{Epoch, HolderId};

use super::models::{AcquireResult, LeaseError, LeaseOutcome, LeaseRecord, LeaseSnapshot};
use super::store::LeaseStore;

pub const DEFAULT_LEASE_TTL_SEC: i64 = 30;

/// Lease manager abstraction.
///
/// The `*_at` methods take the evaluation time explicitly; the plain variants use the
/// wall clock.
pub trait LeaseManager: Send + Sync {
    /// Backend identifier reported in results and events.
    fn backend_name(&self) -> &str;

    fn read_snapshot_at(&self, now: DateTime<Utc>) -> Result<LeaseSnapshot, LeaseError>;

    fn acquire_or_renew_at(
        &self,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AcquireResult, LeaseError>;

    /// Extends the lease only if `holder_id` is the live holder; never acquires.
    fn renew_at(&self, holder_id: &str, now: DateTime<Utc>) -> Result<AcquireResult, LeaseError>;

    /// Gives the lease up early. Only the live holder at `epoch` may release.
    fn release_at(
        &self,
        holder_id: &str,
        epoch: Epoch,
        now: DateTime<Utc>,
    ) -> Result<AcquireResult, LeaseError>;

    fn read_snapshot(&self) -> Result<LeaseSnapshot, LeaseError> {
        self.read_snapshot_at(Utc::now())
    }

    fn acquire_or_renew(&self, holder_id: &str) -> Result<AcquireResult, LeaseError> {
        self.acquire_or_renew_at(holder_id, Utc::now())
    }

    fn renew(&self, holder_id: &str) -> Result<AcquireResult, LeaseError> {
        self.renew_at(holder_id, Utc::now())
    }

    fn release(&self, holder_id: &str, epoch: Epoch) -> Result<AcquireResult, LeaseError> {
        self.release_at(holder_id, epoch, Utc::now())
    }

    /// The live holder, `None` when the lease is expired or unheld.
    fn current_holder(&self) -> Result<Option<HolderId>, LeaseError> {
        Ok(self.read_snapshot()?.live_holder().map(str::to_string))
    }
}

/// Lease manager over a [LeaseStore].
#[derive(Clone)]
pub struct StoreLeaseManager {
    store: Arc<dyn LeaseStore>,
    ttl: Duration,
}

impl StoreLeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl LeaseManager for StoreLeaseManager {
    fn backend_name(&self) -> &str {
        self.store.backend_name()
    }

    fn read_snapshot_at(&self, now: DateTime<Utc>) -> Result<LeaseSnapshot, LeaseError> {
        let record = self.store.read_record()?;
        Ok(LeaseSnapshot::from_record(record.as_ref(), now))
    }

    fn acquire_or_renew_at(
        &self,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AcquireResult, LeaseError> {
        let ttl = self.ttl;
        let mut outcome = LeaseOutcome::Follower;
        let record = self.store.transact(&mut |current| match current {
            Some(record) if record.live_holder(now) == Some(holder_id) => {
                outcome = LeaseOutcome::Renewed;
                Some(record.renewed(now, ttl))
            }
            Some(record) if record.live_holder(now).is_some() => {
                outcome = LeaseOutcome::Follower;
                None
            }
            _ => {
                let previous = current.map(|record| record.epoch).unwrap_or(0);
                outcome = LeaseOutcome::Acquired;
                Some(LeaseRecord::acquired(
                    holder_id,
                    previous.saturating_add(1).max(1),
                    now,
                    ttl,
                ))
            }
        })?;

        match outcome {
            LeaseOutcome::Acquired => log::info!(
                "{} acquired {} lease at epoch {}",
                holder_id,
                self.backend_name(),
                record.as_ref().map(|r| r.epoch).unwrap_or_default()
            ),
            LeaseOutcome::Renewed => log::debug!("{} renewed lease", holder_id),
            _ => log::debug!(
                "{} is follower; lease held by {:?}",
                holder_id,
                record.as_ref().and_then(|r| r.holder_id.as_deref())
            ),
        }
        Ok(AcquireResult::from_record(outcome, record.as_ref(), now))
    }

    fn renew_at(&self, holder_id: &str, now: DateTime<Utc>) -> Result<AcquireResult, LeaseError> {
        let ttl = self.ttl;
        let mut outcome = LeaseOutcome::Follower;
        let record = self.store.transact(&mut |current| match current {
            Some(record) if record.live_holder(now) == Some(holder_id) => {
                outcome = LeaseOutcome::Renewed;
                Some(record.renewed(now, ttl))
            }
            _ => None,
        })?;
        Ok(AcquireResult::from_record(outcome, record.as_ref(), now))
    }

    fn release_at(
        &self,
        holder_id: &str,
        epoch: Epoch,
        now: DateTime<Utc>,
    ) -> Result<AcquireResult, LeaseError> {
        let mut outcome = LeaseOutcome::NotHolder;
        let record = self.store.transact(&mut |current| match current {
            Some(record) if record.live_holder(now) == Some(holder_id) && record.epoch == epoch => {
                outcome = LeaseOutcome::Released;
                Some(record.released(now))
            }
            _ => None,
        })?;
        if outcome == LeaseOutcome::Released {
            log::info!("{} released lease at epoch {}", holder_id, epoch);
        }
        Ok(AcquireResult::from_record(outcome, record.as_ref(), now))
    }
}

/// Label of the same-process fallback store.
pub const FALLBACK_BACKEND: &str = "memory";

/// Lease backend selected by configuration.
#[derive(Clone)]
pub enum LeaseBackend {
    /// A durable store shared by every participant of the domain.
    Store(StoreLeaseManager),
    /// Operator-approved same-process stand-in for a backend that could not be used.
    /// Leadership only excludes callers inside this process; results are relabelled
    /// with `fallback_*` outcomes and `fallback_backend`.
    Fallback {
        requested: String,
        manager: StoreLeaseManager,
    },
    /// Backend missing or misconfigured. Every call answers in observer mode.
    Unavailable { backend: String, reason: String },
}

impl LeaseBackend {
    pub fn is_available(&self) -> bool {
        !matches!(self, LeaseBackend::Unavailable { .. })
    }

    fn observer_mode(backend: &str, reason: &str) -> AcquireResult {
        log::warn!(
            "lease backend '{}' unavailable, staying in observer mode: {}",
            backend,
            reason
        );
        AcquireResult::observer_mode(backend, reason)
    }
}

impl LeaseManager for LeaseBackend {
    fn backend_name(&self) -> &str {
        match self {
            LeaseBackend::Store(manager) => manager.backend_name(),
            LeaseBackend::Fallback { .. } => FALLBACK_BACKEND,
            LeaseBackend::Unavailable { backend, .. } => backend,
        }
    }

    fn read_snapshot_at(&self, now: DateTime<Utc>) -> Result<LeaseSnapshot, LeaseError> {
        match self {
            LeaseBackend::Store(manager) | LeaseBackend::Fallback { manager, .. } => {
                manager.read_snapshot_at(now)
            }
            LeaseBackend::Unavailable { backend, reason } => Err(LeaseError::BackendUnavailable {
                backend: backend.clone(),
                reason: reason.clone(),
            }),
        }
    }

    fn acquire_or_renew_at(
        &self,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AcquireResult, LeaseError> {
        match self {
            LeaseBackend::Store(manager) => manager.acquire_or_renew_at(holder_id, now),
            LeaseBackend::Fallback { requested, manager } => Ok(manager
                .acquire_or_renew_at(holder_id, now)?
                .into_fallback(FALLBACK_BACKEND, requested)),
            LeaseBackend::Unavailable { backend, reason } => {
                Ok(Self::observer_mode(backend, reason))
            }
        }
    }

    fn renew_at(&self, holder_id: &str, now: DateTime<Utc>) -> Result<AcquireResult, LeaseError> {
        match self {
            LeaseBackend::Store(manager) => manager.renew_at(holder_id, now),
            LeaseBackend::Fallback { requested, manager } => Ok(manager
                .renew_at(holder_id, now)?
                .into_fallback(FALLBACK_BACKEND, requested)),
            LeaseBackend::Unavailable { backend, reason } => {
                Ok(Self::observer_mode(backend, reason))
            }
        }
    }

    fn release_at(
        &self,
        holder_id: &str,
        epoch: Epoch,
        now: DateTime<Utc>,
    ) -> Result<AcquireResult, LeaseError> {
        match self {
            LeaseBackend::Store(manager) => manager.release_at(holder_id, epoch, now),
            LeaseBackend::Fallback { requested, manager } => Ok(manager
                .release_at(holder_id, epoch, now)?
                .into_fallback(FALLBACK_BACKEND, requested)),
            LeaseBackend::Unavailable { backend, reason } => {
                Ok(Self::observer_mode(backend, reason))
            }
        }
    }
}
