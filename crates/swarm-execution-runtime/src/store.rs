//! Lease store adapter: durable storage of the single lease record.

use std::sync::Mutex;

use super::models::{LeaseError, LeaseRecord};

/// Mutation applied inside [LeaseStore::transact]. Receives the current record (`None`
/// when missing or unreadable) and returns the record to write, or `None` to leave the
/// store untouched.
pub type LeaseUpdate<'a> = dyn FnMut(Option<&LeaseRecord>) -> Option<LeaseRecord> + 'a;

/// Storage contract for one coordination domain's lease record.
///
/// Implementations must make [LeaseStore::transact] atomic with respect to every other
/// caller of the same store, in this process and in others: no two transactions may
/// interleave their read and write, and a reader never observes a half-written record.
/// A record that exists but cannot be decoded is handed to the update as `None`.
pub trait LeaseStore: Send + Sync {
    /// Identifier of the backend (`file`, `sqlite`, `memory`).
    fn backend_name(&self) -> &'static str;

    /// Reads the current record. `Ok(None)` for missing or undecodable records.
    fn read_record(&self) -> Result<Option<LeaseRecord>, LeaseError>;

    /// Read-modify-write under the store's exclusive lock. Returns the record as stored
    /// once the transaction finishes.
    fn transact(&self, update: &mut LeaseUpdate<'_>) -> Result<Option<LeaseRecord>, LeaseError>;
}

/// Decodes a stored record. Corruption is logged and treated as "no record" so a bad
/// write cannot wedge leadership forever.
pub(crate) fn decode_record(backend: &str, bytes: &[u8]) -> Option<LeaseRecord> {
    match serde_json::from_slice::<LeaseRecord>(bytes) {
        Ok(record) => Some(record),
        Err(err) => {
            log::warn!(
                "{} lease record is corrupt, treating as vacant: {}",
                backend,
                err
            );
            None
        }
    }
}

pub(crate) fn map_store_err(prefix: &str, err: impl std::fmt::Display) -> LeaseError {
    LeaseError::BackingStore(format!("{prefix}: {err}"))
}

/// Same-process lease store. Only coordinates callers sharing this instance.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    record: Mutex<Option<LeaseRecord>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn read_record(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        let guard = self
            .record
            .lock()
            .map_err(|_| map_store_err("lock poisoned", "mutex poisoned"))?;
        Ok(guard.clone())
    }

    fn transact(&self, update: &mut LeaseUpdate<'_>) -> Result<Option<LeaseRecord>, LeaseError> {
        let mut guard = self
            .record
            .lock()
            .map_err(|_| map_store_err("lock poisoned", "mutex poisoned"))?;
        if let Some(next) = update(guard.as_ref()) {
            *guard = Some(next);
        }
        Ok(guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    #[test]
    fn transact_without_mutation_leaves_record() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();
        store
            .transact(&mut |_| Some(LeaseRecord::acquired("w1", 1, now, Duration::seconds(5))))
            .unwrap();
        let after = store.transact(&mut |_| None).unwrap().unwrap();
        assert_eq!(after.holder_id.as_deref(), Some("w1"));
        assert_eq!(store.read_record().unwrap(), Some(after));
    }

    #[test]
    fn corrupt_bytes_decode_as_vacant() {
        assert!(decode_record("file", b"{\"holder_id\": 3").is_none());
        assert!(decode_record("file", b"").is_none());
    }
}
