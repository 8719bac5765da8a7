//! Lease domain models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use swarm_kernel::identity::{Epoch, HolderId};

/// Errors surfaced by lease stores and managers.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease backing store error: {0}")]
    BackingStore(String),
    #[error("lease backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },
    #[error("invalid lease configuration: {0}")]
    Config(String),
}

/// The single durable lease record of a coordination domain.
///
/// Never deleted. Expiry is implicit (`expires_at <= now`) and release clears the
/// holder while keeping the epoch, so the next acquisition still advances it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder_id: Option<HolderId>,
    pub epoch: Epoch,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_sec: u64,
    pub updated_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// New leadership for `holder_id` at `epoch`.
    pub fn acquired(holder_id: &str, epoch: Epoch, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            holder_id: Some(holder_id.to_string()),
            epoch,
            acquired_at: now,
            expires_at: now + ttl,
            ttl_sec: ttl.num_seconds().max(0) as u64,
            updated_at: now,
        }
    }

    /// Same holder and epoch, expiry pushed out. Expiry never moves backwards, even
    /// when two renewals observe the same clock reading.
    pub fn renewed(&self, now: DateTime<Utc>, ttl: Duration) -> Self {
        let extended = now + ttl;
        let expires_at = if extended > self.expires_at {
            extended
        } else {
            self.expires_at + Duration::microseconds(1)
        };
        Self {
            expires_at,
            ttl_sec: ttl.num_seconds().max(0) as u64,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Holder cleared and expiry set to `now`; epoch kept.
    pub fn released(&self, now: DateTime<Utc>) -> Self {
        Self {
            holder_id: None,
            expires_at: now,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Unheld, already expired record that only carries `epoch` forward.
    pub fn vacant(epoch: Epoch, now: DateTime<Utc>) -> Self {
        Self {
            holder_id: None,
            epoch,
            acquired_at: now,
            expires_at: now,
            ttl_sec: 0,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// The holder, if the record is both held and unexpired.
    pub fn live_holder(&self, now: DateTime<Utc>) -> Option<&str> {
        if self.is_expired(now) {
            return None;
        }
        self.holder_id.as_deref()
    }
}

/// Read-only view of the lease at a point in time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSnapshot {
    pub holder_id: Option<HolderId>,
    pub epoch: Epoch,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

impl LeaseSnapshot {
    /// No holder, epoch 0, expired. Used for missing or unreadable records.
    pub fn vacant() -> Self {
        Self {
            holder_id: None,
            epoch: 0,
            expires_at: None,
            expired: true,
        }
    }

    pub fn from_record(record: Option<&LeaseRecord>, now: DateTime<Utc>) -> Self {
        match record {
            Some(record) => Self {
                holder_id: record.holder_id.clone(),
                epoch: record.epoch,
                expires_at: Some(record.expires_at),
                expired: record.is_expired(now),
            },
            None => Self::vacant(),
        }
    }

    /// The holder while the lease is live.
    pub fn live_holder(&self) -> Option<&str> {
        if self.expired {
            return None;
        }
        self.holder_id.as_deref()
    }
}

/// Proof of leadership handed to a successful acquirer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochToken {
    pub holder_id: HolderId,
    pub epoch: Epoch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    Acquired,
    Renewed,
    Follower,
    Released,
    NotHolder,
    ObserverMode,
    FallbackAcquired,
    FallbackRenewed,
    FallbackFollower,
}

impl LeaseOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseOutcome::Acquired => "acquired",
            LeaseOutcome::Renewed => "renewed",
            LeaseOutcome::Follower => "follower",
            LeaseOutcome::Released => "released",
            LeaseOutcome::NotHolder => "not_holder",
            LeaseOutcome::ObserverMode => "observer_mode",
            LeaseOutcome::FallbackAcquired => "fallback_acquired",
            LeaseOutcome::FallbackRenewed => "fallback_renewed",
            LeaseOutcome::FallbackFollower => "fallback_follower",
        }
    }

    fn into_fallback(self) -> Self {
        match self {
            LeaseOutcome::Acquired => LeaseOutcome::FallbackAcquired,
            LeaseOutcome::Renewed => LeaseOutcome::FallbackRenewed,
            LeaseOutcome::Follower => LeaseOutcome::FallbackFollower,
            other => other,
        }
    }
}

/// Result of acquire/renew/release.
///
/// `is_leader` is true only for `acquired`/`renewed` (and their fallback variants) and
/// is never true in observer mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireResult {
    pub is_leader: bool,
    pub outcome: LeaseOutcome,
    pub snapshot: LeaseSnapshot,
    pub token: Option<EpochToken>,
    pub observer_mode: bool,
    pub retryable: bool,
    pub fallback_backend: Option<String>,
    pub reason: Option<String>,
}

impl AcquireResult {
    pub fn from_record(
        outcome: LeaseOutcome,
        record: Option<&LeaseRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        let snapshot = LeaseSnapshot::from_record(record, now);
        let is_leader = matches!(outcome, LeaseOutcome::Acquired | LeaseOutcome::Renewed);
        let token = match (is_leader, snapshot.live_holder()) {
            (true, Some(holder)) => Some(EpochToken {
                holder_id: holder.to_string(),
                epoch: snapshot.epoch,
            }),
            _ => None,
        };
        Self {
            is_leader: token.is_some(),
            outcome,
            snapshot,
            token,
            observer_mode: false,
            retryable: false,
            fallback_backend: None,
            reason: None,
        }
    }

    /// Backend missing or misconfigured: never a leader, caller should retry later.
    pub fn observer_mode(backend: &str, reason: impl Into<String>) -> Self {
        Self {
            is_leader: false,
            outcome: LeaseOutcome::ObserverMode,
            snapshot: LeaseSnapshot::vacant(),
            token: None,
            observer_mode: true,
            retryable: true,
            fallback_backend: None,
            reason: Some(format!("backend '{}': {}", backend, reason.into())),
        }
    }

    /// Relabels a result produced by the same-process fallback store.
    pub fn into_fallback(mut self, fallback_backend: &str, requested: &str) -> Self {
        self.outcome = self.outcome.into_fallback();
        self.fallback_backend = Some(fallback_backend.to_string());
        self.reason = Some(format!(
            "backend '{}' unavailable; using same-process '{}' fallback",
            requested, fallback_backend
        ));
        self
    }

    pub fn epoch(&self) -> Epoch {
        self.snapshot.epoch
    }
}
