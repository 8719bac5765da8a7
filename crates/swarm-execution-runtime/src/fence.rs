//! Epoch fencing: the split-brain guard in front of every mutating action.
//!
//! A process that has not yet noticed it lost the lease still believes its old epoch is
//! good. [EpochFence::fenced_execute] re-reads the live lease immediately before the
//! operation and refuses to run it unless the presented holder and epoch still match.
//! There is no in-band cancellation: once validation passes, the operation runs to
//! completion even if a new epoch is issued meanwhile; the next fenced call is blocked.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use swarm_kernel::identity::{Epoch, HolderId};

use super::lease::LeaseManager;
use super::models::LeaseSnapshot;

/// Outcome of [EpochFence::validate_epoch].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceCheck {
    pub ok: bool,
    pub reason: String,
}

/// Result of a fenced operation. Exactly one of `result` / `reason` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FencedResult<T> {
    pub ok: bool,
    /// True when the operation was refused before running.
    pub fenced: bool,
    pub epoch: Epoch,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub result: Option<T>,
    pub reason: Option<String>,
}

impl<T> FencedResult<T> {
    fn rejected(epoch: Epoch, action: &str, reason: String) -> Self {
        Self {
            ok: false,
            fenced: true,
            epoch,
            action: action.to_string(),
            timestamp: Utc::now(),
            result: None,
            reason: Some(reason),
        }
    }

    fn failed(epoch: Epoch, action: &str, reason: String) -> Self {
        Self {
            ok: false,
            fenced: false,
            epoch,
            action: action.to_string(),
            timestamp: Utc::now(),
            result: None,
            reason: Some(reason),
        }
    }

    fn succeeded(epoch: Epoch, action: &str, value: T) -> Self {
        Self {
            ok: true,
            fenced: false,
            epoch,
            action: action.to_string(),
            timestamp: Utc::now(),
            result: Some(value),
            reason: None,
        }
    }
}

/// Where a holder stands relative to the live lease.
///
/// UNKNOWN -> FOLLOWER -> LEADER(E) -> SUPERSEDED(E' > E) -> FOLLOWER, indefinitely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum FenceRole {
    /// The lease could not be read.
    Unknown,
    Follower,
    Leader { epoch: Epoch },
    /// The holder last led at `held_epoch` and the lease has since moved on.
    Superseded { held_epoch: Epoch, live_epoch: Epoch },
}

impl FenceRole {
    /// Classifies `holder_id` given the epoch it believes it holds.
    pub fn observe(holder_id: &str, held_epoch: Option<Epoch>, snapshot: &LeaseSnapshot) -> Self {
        let live_holder = snapshot.live_holder();
        match held_epoch {
            Some(held) if live_holder == Some(holder_id) && snapshot.epoch == held => {
                FenceRole::Leader { epoch: held }
            }
            Some(held) if snapshot.epoch > held => FenceRole::Superseded {
                held_epoch: held,
                live_epoch: snapshot.epoch,
            },
            _ if live_holder == Some(holder_id) => FenceRole::Leader {
                epoch: snapshot.epoch,
            },
            _ => FenceRole::Follower,
        }
    }
}

/// Fence bound to one holder.
#[derive(Clone)]
pub struct EpochFence {
    lease: Arc<dyn LeaseManager>,
    holder_id: HolderId,
}

impl EpochFence {
    pub fn new(lease: Arc<dyn LeaseManager>, holder_id: impl Into<HolderId>) -> Self {
        Self {
            lease,
            holder_id: holder_id.into(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Checks `(holder_id, epoch)` against the live lease. An unreadable lease fails
    /// the check.
    pub fn validate_epoch(&self, holder_id: &str, epoch: Epoch) -> FenceCheck {
        let snapshot = match self.lease.read_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return FenceCheck {
                    ok: false,
                    reason: format!("lease unreadable: {}", err),
                }
            }
        };
        let reason = match snapshot.live_holder() {
            None if snapshot.holder_id.is_some() => format!(
                "lease expired (last holder {:?} at epoch {})",
                snapshot.holder_id, snapshot.epoch
            ),
            None => "lease not held".to_string(),
            Some(live) if live != holder_id => {
                format!("lease held by {} at epoch {}", live, snapshot.epoch)
            }
            Some(_) if snapshot.epoch != epoch => format!(
                "stale epoch {}; live epoch is {}",
                epoch, snapshot.epoch
            ),
            Some(_) => {
                return FenceCheck {
                    ok: true,
                    reason: "epoch valid".to_string(),
                }
            }
        };
        FenceCheck { ok: false, reason }
    }

    /// Runs `operation` only if this fence's holder still owns the lease at `epoch`.
    ///
    /// A failed validation returns `fenced = true` without calling `operation`. An
    /// `Err` or a panic from `operation` returns `ok = false, fenced = false` and the
    /// fence stays usable.
    pub fn fenced_execute<T, E, F>(
        &self,
        epoch: Epoch,
        action: &str,
        operation: F,
    ) -> FencedResult<T>
    where
        E: std::fmt::Display,
        F: FnOnce() -> Result<T, E>,
    {
        let check = self.validate_epoch(&self.holder_id, epoch);
        if !check.ok {
            log::warn!(
                "fenced {} for {} at epoch {}: {}",
                action,
                self.holder_id,
                epoch,
                check.reason
            );
            return FencedResult::rejected(epoch, action, check.reason);
        }

        match panic::catch_unwind(AssertUnwindSafe(operation)) {
            Ok(Ok(value)) => FencedResult::succeeded(epoch, action, value),
            Ok(Err(err)) => FencedResult::failed(epoch, action, err.to_string()),
            Err(payload) => FencedResult::failed(
                epoch,
                action,
                format!("operation panicked: {}", panic_message(payload.as_ref())),
            ),
        }
    }

    /// This holder's role given the epoch it believes it holds.
    pub fn role(&self, held_epoch: Option<Epoch>) -> FenceRole {
        match self.lease.read_snapshot() {
            Ok(snapshot) => FenceRole::observe(&self.holder_id, held_epoch, &snapshot),
            Err(_) => FenceRole::Unknown,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use chrono::Duration;

    use super::*;
    use crate::lease::{LeaseBackend, StoreLeaseManager};
    use crate::store::InMemoryLeaseStore;

    fn shared_lease() -> Arc<StoreLeaseManager> {
        Arc::new(StoreLeaseManager::new(
            Arc::new(InMemoryLeaseStore::new()),
            Duration::seconds(30),
        ))
    }

    #[test]
    fn valid_epoch_runs_operation() {
        let lease = shared_lease();
        let epoch = lease.acquire_or_renew("w1").unwrap().epoch();
        let fence = EpochFence::new(lease, "w1");

        let result = fence.fenced_execute(epoch, "write-config", || Ok::<_, String>(42));
        assert!(result.ok);
        assert!(!result.fenced);
        assert_eq!(result.result, Some(42));
        assert_eq!(result.epoch, epoch);
        assert_eq!(result.action, "write-config");
    }

    #[test]
    fn stale_epoch_never_invokes_operation() {
        let lease = shared_lease();
        let t0 = Utc::now();
        lease.acquire_or_renew_at("w1", t0 - Duration::seconds(40)).unwrap();
        let takeover = lease.acquire_or_renew("w2").unwrap();
        assert_eq!(takeover.epoch(), 2);

        let fence = EpochFence::new(lease, "w1");
        let calls = Cell::new(0);
        let result = fence.fenced_execute(1, "merge", || {
            calls.set(calls.get() + 1);
            Ok::<_, String>(())
        });
        assert_eq!(calls.get(), 0);
        assert!(!result.ok);
        assert!(result.fenced);
        assert!(result.reason.unwrap().contains("held by w2"));
    }

    #[test]
    fn wrong_epoch_for_live_holder_is_fenced() {
        let lease = shared_lease();
        lease.acquire_or_renew("w1").unwrap();
        let fence = EpochFence::new(lease, "w1");
        let check = fence.validate_epoch("w1", 7);
        assert!(!check.ok);
        assert!(check.reason.contains("stale epoch 7"));
    }

    #[test]
    fn expired_lease_fails_validation() {
        let lease = shared_lease();
        lease
            .acquire_or_renew_at("w1", Utc::now() - Duration::seconds(60))
            .unwrap();
        let fence = EpochFence::new(lease, "w1");
        let check = fence.validate_epoch("w1", 1);
        assert!(!check.ok);
        assert!(check.reason.contains("expired"));
    }

    #[test]
    fn operation_error_is_captured_and_fence_stays_usable() {
        let lease = shared_lease();
        let epoch = lease.acquire_or_renew("w1").unwrap().epoch();
        let fence = EpochFence::new(lease, "w1");

        let failed = fence.fenced_execute(epoch, "push", || Err::<(), _>("remote rejected"));
        assert!(!failed.ok);
        assert!(!failed.fenced);
        assert_eq!(failed.reason.as_deref(), Some("remote rejected"));

        let again = fence.fenced_execute(epoch, "push", || Ok::<_, String>("done"));
        assert!(again.ok);
    }

    #[test]
    fn operation_panic_is_captured() {
        let lease = shared_lease();
        let epoch = lease.acquire_or_renew("w1").unwrap().epoch();
        let fence = EpochFence::new(lease, "w1");

        let result = fence.fenced_execute(epoch, "explode", || -> Result<(), String> {
            panic!("boom");
        });
        assert!(!result.ok);
        assert!(!result.fenced);
        assert!(result.reason.unwrap().contains("boom"));
        assert!(fence.validate_epoch("w1", epoch).ok);
    }

    #[test]
    fn unavailable_backend_fences_everything() {
        let backend = Arc::new(LeaseBackend::Unavailable {
            backend: "consul".into(),
            reason: "missing SWARM_LEASE_REMOTE_URL".into(),
        });
        let fence = EpochFence::new(backend, "w1");
        let result = fence.fenced_execute(1, "anything", || Ok::<_, String>(()));
        assert!(result.fenced);
        assert_eq!(fence.role(Some(1)), FenceRole::Unknown);
    }

    #[test]
    fn role_cycles_through_superseded() {
        let lease = shared_lease();
        let fence = EpochFence::new(lease.clone(), "w1");
        assert_eq!(fence.role(None), FenceRole::Follower);

        let t0 = Utc::now() - Duration::seconds(40);
        lease.acquire_or_renew_at("w1", t0).unwrap();
        lease.acquire_or_renew("w2").unwrap();
        assert_eq!(
            fence.role(Some(1)),
            FenceRole::Superseded {
                held_epoch: 1,
                live_epoch: 2
            }
        );
        assert_eq!(fence.role(None), FenceRole::Follower);

        let leader = FenceRole::observe(
            "w2",
            Some(2),
            &lease.read_snapshot().unwrap(),
        );
        assert_eq!(leader, FenceRole::Leader { epoch: 2 });
    }
}
