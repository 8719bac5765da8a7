//! File-backed lease store.
//!
//! The record lives in a JSON file written temp-then-rename. Transactions hold an
//! in-process mutex plus an exclusive advisory lock on a sibling `.lock` file, so
//! acquisitions from separate processes on the same host serialize.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use swarm_kernel::snapshot::write_json_atomic;

use super::models::{LeaseError, LeaseRecord};
use super::store::{decode_record, map_store_err, LeaseStore, LeaseUpdate};

pub struct FileLeaseStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileLeaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn open_lock_file(&self) -> Result<File, LeaseError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| map_store_err("create parent dir", e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.lock_path())
            .map_err(|e| map_store_err("open lock file", e))?;
        FileExt::lock_exclusive(&file).map_err(|e| map_store_err("lock lease file", e))?;
        Ok(file)
    }

    fn read_unlocked(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(decode_record(self.backend_name(), &bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(map_store_err("read lease file", err)),
        }
    }
}

impl LeaseStore for FileLeaseStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    // Rename is atomic, so reads need no lock.
    fn read_record(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        self.read_unlocked()
    }

    fn transact(&self, update: &mut LeaseUpdate<'_>) -> Result<Option<LeaseRecord>, LeaseError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| map_store_err("lock poisoned", "mutex poisoned"))?;
        let lock_file = self.open_lock_file()?;

        let current = self.read_unlocked()?;
        let outcome = match update(current.as_ref()) {
            Some(next) => {
                write_json_atomic(&self.path, &next)
                    .map_err(|e| map_store_err("write lease file", e))?;
                Some(next)
            }
            None => current,
        };

        FileExt::unlock(&lock_file).map_err(|e| map_store_err("unlock lease file", e))?;
        Ok(outcome)
    }
}
