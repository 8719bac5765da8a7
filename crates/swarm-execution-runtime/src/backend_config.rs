//! Lease backend selection from the environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;

use swarm_kernel::identity::HolderId;
use swarm_kernel::observer::DEFAULT_MAX_EVENTS;

use super::file_store::FileLeaseStore;
use super::lease::{LeaseBackend, StoreLeaseManager, DEFAULT_LEASE_TTL_SEC};
use super::models::LeaseError;
#[cfg(feature = "sqlite-persistence")]
use super::sqlite_store::SqliteLeaseStore;
use super::store::InMemoryLeaseStore;

pub const DEFAULT_LEASE_PATH: &str = ".swarm/lease.json";
pub const DEFAULT_SQLITE_DB_PATH: &str = ".swarm/lease.db";
pub const DEFAULT_DOMAIN: &str = "default";

/// Remote backends that are recognised but have no client in this build.
const REMOTE_BACKENDS: [&str; 4] = ["redis", "etcd", "consul", "postgres"];

const ENV_KEYS: [&str; 9] = [
    "SWARM_LEASE_BACKEND",
    "SWARM_LEASE_PATH",
    "SWARM_LEASE_SQLITE_DB",
    "SWARM_LEASE_REMOTE_URL",
    "SWARM_LEASE_TTL_SEC",
    "SWARM_LEASE_DOMAIN",
    "SWARM_NODE_ID",
    "SWARM_LEASE_ALLOW_FALLBACK",
    "SWARM_OBSERVER_MAX_EVENTS",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseBackendKind {
    File,
    Sqlite,
    /// One of `redis`, `etcd`, `consul`, `postgres`.
    Remote(String),
}

impl LeaseBackendKind {
    pub fn as_str(&self) -> &str {
        match self {
            LeaseBackendKind::File => "file",
            LeaseBackendKind::Sqlite => "sqlite",
            LeaseBackendKind::Remote(name) => name,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub backend: LeaseBackendKind,
    pub domain: String,
    pub node_id: HolderId,
    pub ttl: Duration,
    pub file_path: PathBuf,
    pub sqlite_db_path: PathBuf,
    pub remote_url: Option<String>,
    pub allow_fallback: bool,
    pub observer_max_events: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            backend: LeaseBackendKind::File,
            domain: DEFAULT_DOMAIN.to_string(),
            node_id: default_node_id(),
            ttl: Duration::seconds(DEFAULT_LEASE_TTL_SEC),
            file_path: PathBuf::from(DEFAULT_LEASE_PATH),
            sqlite_db_path: PathBuf::from(DEFAULT_SQLITE_DB_PATH),
            remote_url: None,
            allow_fallback: false,
            observer_max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

impl LeaseConfig {
    pub fn from_env() -> Result<Self, LeaseError> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, LeaseError> {
        let non_empty = |key: &str| {
            envs.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let backend_raw = non_empty("SWARM_LEASE_BACKEND")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(|| "file".to_string());
        let backend = match backend_raw.as_str() {
            "file" => LeaseBackendKind::File,
            "sqlite" => LeaseBackendKind::Sqlite,
            remote if REMOTE_BACKENDS.contains(&remote) => {
                LeaseBackendKind::Remote(remote.to_string())
            }
            other => {
                return Err(LeaseError::Config(format!(
                    "invalid SWARM_LEASE_BACKEND='{}'. expected one of: file, sqlite, {}",
                    other,
                    REMOTE_BACKENDS.join(", ")
                )));
            }
        };

        let ttl_sec = match non_empty("SWARM_LEASE_TTL_SEC") {
            Some(raw) => match raw.parse::<i64>() {
                Ok(sec) if sec > 0 => sec,
                _ => {
                    return Err(LeaseError::Config(format!(
                        "invalid SWARM_LEASE_TTL_SEC='{}'. expected a positive integer",
                        raw
                    )));
                }
            },
            None => DEFAULT_LEASE_TTL_SEC,
        };

        let observer_max_events = match non_empty("SWARM_OBSERVER_MAX_EVENTS") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                LeaseError::Config(format!(
                    "invalid SWARM_OBSERVER_MAX_EVENTS='{}'. expected a non-negative integer",
                    raw
                ))
            })?,
            None => DEFAULT_MAX_EVENTS,
        };

        Ok(Self {
            backend,
            domain: non_empty("SWARM_LEASE_DOMAIN").unwrap_or_else(|| DEFAULT_DOMAIN.to_string()),
            node_id: non_empty("SWARM_NODE_ID").unwrap_or_else(default_node_id),
            ttl: Duration::seconds(ttl_sec),
            file_path: non_empty("SWARM_LEASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEASE_PATH)),
            sqlite_db_path: non_empty("SWARM_LEASE_SQLITE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_DB_PATH)),
            remote_url: non_empty("SWARM_LEASE_REMOTE_URL"),
            allow_fallback: envs
                .get("SWARM_LEASE_ALLOW_FALLBACK")
                .map(|v| parse_bool(v))
                .unwrap_or(false),
            observer_max_events,
        })
    }

    /// Builds the configured backend. Backends that cannot be used in this build turn
    /// into [LeaseBackend::Unavailable], or into the same-process fallback when
    /// `allow_fallback` is set.
    pub fn build_backend(&self) -> LeaseBackend {
        match &self.backend {
            LeaseBackendKind::File => LeaseBackend::Store(StoreLeaseManager::new(
                Arc::new(FileLeaseStore::new(self.file_path.clone())),
                self.ttl,
            )),
            LeaseBackendKind::Sqlite => self.build_sqlite_backend(),
            LeaseBackendKind::Remote(name) => {
                let reason = if self.remote_url.is_none() {
                    "missing SWARM_LEASE_REMOTE_URL".to_string()
                } else {
                    format!("no {} client compiled into this build", name)
                };
                self.unavailable_or_fallback(name, reason)
            }
        }
    }

    #[cfg(feature = "sqlite-persistence")]
    fn build_sqlite_backend(&self) -> LeaseBackend {
        LeaseBackend::Store(StoreLeaseManager::new(
            Arc::new(SqliteLeaseStore::new(
                self.sqlite_db_path.clone(),
                self.domain.clone(),
            )),
            self.ttl,
        ))
    }

    #[cfg(not(feature = "sqlite-persistence"))]
    fn build_sqlite_backend(&self) -> LeaseBackend {
        self.unavailable_or_fallback(
            "sqlite",
            "SWARM_LEASE_BACKEND=sqlite requires feature 'sqlite-persistence'".to_string(),
        )
    }

    fn unavailable_or_fallback(&self, backend: &str, reason: String) -> LeaseBackend {
        if self.allow_fallback {
            log::warn!(
                "lease backend '{}' unusable ({}); falling back to same-process store",
                backend,
                reason
            );
            LeaseBackend::Fallback {
                requested: backend.to_string(),
                manager: StoreLeaseManager::new(Arc::new(InMemoryLeaseStore::new()), self.ttl),
            }
        } else {
            LeaseBackend::Unavailable {
                backend: backend.to_string(),
                reason,
            }
        }
    }
}

fn default_node_id() -> HolderId {
    format!("node-{}", std::process::id())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
