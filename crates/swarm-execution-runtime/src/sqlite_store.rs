//! SQLite-backed lease store.
//!
//! One row per coordination domain. Transactions open with `BEGIN IMMEDIATE`, which
//! takes SQLite's write lock before the read, so concurrent acquisitions from any
//! number of processes sharing the database file serialize.
//!
//! This module is feature-gated behind `sqlite-persistence`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::models::{LeaseError, LeaseRecord};
use super::store::{decode_record, map_store_err, LeaseStore, LeaseUpdate};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteLeaseStore {
    db_path: PathBuf,
    domain: String,
    lock: Mutex<()>,
}

impl SqliteLeaseStore {
    pub fn new(path: impl Into<PathBuf>, domain: impl Into<String>) -> Self {
        Self {
            db_path: path.into(),
            domain: domain.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn open_connection(&self) -> Result<Connection, LeaseError> {
        if let Some(parent) = Path::new(&self.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| map_store_err("create parent dir", e))?;
            }
        }
        let conn =
            Connection::open(&self.db_path).map_err(|e| map_store_err("open sqlite db", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| map_store_err("set busy_timeout", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_store_err("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| map_store_err("set synchronous", e))?;
        self.ensure_schema(&conn)?;
        Ok(conn)
    }

    fn ensure_schema(&self, conn: &Connection) -> Result<(), LeaseError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS coordination_lease (
                domain TEXT PRIMARY KEY,
                record_json TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| map_store_err("ensure schema", e))?;
        Ok(())
    }

    /// A row whose JSON no longer decodes still yields its `epoch` column, so the next
    /// acquisition advances past it instead of restarting at 1.
    fn select_record(&self, conn: &Connection) -> Result<Option<LeaseRecord>, LeaseError> {
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT record_json, epoch FROM coordination_lease WHERE domain = ?1",
                params![self.domain],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| map_store_err("read lease row", e))?;
        Ok(row.map(|(json, epoch)| {
            decode_record(self.backend_name(), json.as_bytes())
                .unwrap_or_else(|| LeaseRecord::vacant(epoch.max(0) as u64, Utc::now()))
        }))
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn read_record(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| map_store_err("lock poisoned", "mutex poisoned"))?;
        let conn = self.open_connection()?;
        self.select_record(&conn)
    }

    fn transact(&self, update: &mut LeaseUpdate<'_>) -> Result<Option<LeaseRecord>, LeaseError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| map_store_err("lock poisoned", "mutex poisoned"))?;
        let mut conn = self.open_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_store_err("begin tx", e))?;

        let current = self.select_record(&tx)?;
        let Some(next) = update(current.as_ref()) else {
            tx.rollback().map_err(|e| map_store_err("rollback tx", e))?;
            return Ok(current);
        };

        let json = serde_json::to_string(&next).map_err(|e| map_store_err("serialize lease", e))?;
        tx.execute(
            "INSERT INTO coordination_lease (domain, record_json, epoch, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(domain) DO UPDATE SET
                record_json = excluded.record_json,
                epoch = excluded.epoch,
                updated_at_ms = excluded.updated_at_ms",
            params![
                self.domain,
                json,
                next.epoch as i64,
                Utc::now().timestamp_millis()
            ],
        )
        .map_err(|e| map_store_err("upsert lease row", e))?;
        tx.commit().map_err(|e| map_store_err("commit tx", e))?;
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::lease::{LeaseManager, StoreLeaseManager};

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("swarm-sqlite-lease-{}", uuid::Uuid::new_v4()))
            .join("lease.db")
    }

    #[test]
    fn domains_are_isolated() {
        let path = temp_db_path();
        let alpha = SqliteLeaseStore::new(&path, "alpha");
        let beta = SqliteLeaseStore::new(&path, "beta");
        alpha
            .transact(&mut |_| {
                Some(LeaseRecord::acquired(
                    "w1",
                    1,
                    Utc::now(),
                    ChronoDuration::seconds(30),
                ))
            })
            .unwrap();
        assert!(beta.read_record().unwrap().is_none());
        assert_eq!(alpha.read_record().unwrap().unwrap().epoch, 1);
    }

    #[test]
    fn upsert_replaces_row() {
        let path = temp_db_path();
        let store = SqliteLeaseStore::new(&path, "default");
        for epoch in 1..=3 {
            store
                .transact(&mut |_| {
                    Some(LeaseRecord::acquired(
                        "w1",
                        epoch,
                        Utc::now(),
                        ChronoDuration::seconds(30),
                    ))
                })
                .unwrap();
        }
        let reopened = SqliteLeaseStore::new(&path, "default");
        assert_eq!(reopened.read_record().unwrap().unwrap().epoch, 3);
    }

    #[test]
    fn no_mutation_keeps_current_row() {
        let store = SqliteLeaseStore::new(temp_db_path(), "default");
        let empty = store.transact(&mut |_| None).unwrap();
        assert!(empty.is_none());
        assert!(store.read_record().unwrap().is_none());
    }

    #[test]
    fn corrupt_json_keeps_epoch_column() {
        let path = temp_db_path();
        let store = SqliteLeaseStore::new(&path, "default");
        store
            .transact(&mut |_| {
                Some(LeaseRecord::acquired(
                    "w1",
                    4,
                    Utc::now(),
                    ChronoDuration::seconds(30),
                ))
            })
            .unwrap();
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE coordination_lease SET record_json = '{ torn' WHERE domain = 'default'",
            [],
        )
        .unwrap();

        let record = store.read_record().unwrap().unwrap();
        assert_eq!(record.epoch, 4);
        assert!(record.holder_id.is_none());
        assert!(record.is_expired(Utc::now()));

        let lease = StoreLeaseManager::new(Arc::new(store), ChronoDuration::seconds(30));
        let next = lease.acquire_or_renew("w2").unwrap();
        assert!(next.is_leader);
        assert_eq!(next.epoch(), 5);
    }
}
