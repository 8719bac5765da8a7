//! DAG progress snapshots.
//!
//! A snapshot carries only per-node status and timestamps. Edges are not persisted:
//! the new leader rebuilds the graph from code/config and then overlays the snapshot,
//! so completed work is resumed rather than re-run.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::kernel::dag::NodeStatus;
use crate::kernel::identity::NodeId;
use crate::kernel::KernelError;

/// Persisted progress of a single DAG node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProgress {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Snapshot document: node_id -> progress.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DagSnapshot {
    pub nodes: BTreeMap<NodeId, NodeProgress>,
}

impl DagSnapshot {
    pub fn get(&self, node_id: &str) -> Option<&NodeProgress> {
        self.nodes.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Writes the snapshot document atomically.
    pub fn write_to(&self, path: &Path) -> Result<(), KernelError> {
        write_json_atomic(path, self)
    }

    /// Reads a snapshot document. Returns `Ok(None)` when no snapshot has been written yet.
    pub fn read_from(path: &Path) -> Result<Option<Self>, KernelError> {
        read_json_optional(path)
            .map_err(|err| KernelError::Snapshot(format!("{}: {}", path.display(), err)))
    }
}

/// Serializes `value` to a uniquely named sibling temp file, syncs it, then renames it
/// over `path`. Readers observe either the previous document or the new one, never a
/// partial write, even with concurrent writers to the same `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), KernelError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut temp_file = NamedTempFile::new_in(parent)?;
    temp_file.write_all(&bytes)?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, KernelError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("swarm-kernel-snapshot-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn missing_snapshot_reads_as_none() {
        let path = temp_path("absent.json");
        assert!(DagSnapshot::read_from(&path).unwrap().is_none());
    }

    #[test]
    fn snapshot_document_is_keyed_by_node_id() {
        let started = Utc::now();
        let mut snapshot = DagSnapshot::default();
        snapshot.nodes.insert(
            "build".into(),
            NodeProgress {
                status: NodeStatus::Running,
                started_at: Some(started),
                ended_at: None,
            },
        );

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["build"]["status"], "running");
        assert!(value["build"]["ended_at"].is_null());
        assert!(value.get("nodes").is_none());
    }

    #[test]
    fn write_then_read_preserves_progress() {
        let path = temp_path("dag.json");
        let mut snapshot = DagSnapshot::default();
        snapshot.nodes.insert(
            "a".into(),
            NodeProgress {
                status: NodeStatus::Done,
                started_at: Some(Utc::now()),
                ended_at: Some(Utc::now()),
            },
        );
        snapshot.write_to(&path).unwrap();

        let loaded = DagSnapshot::read_from(&path).unwrap().expect("snapshot exists");
        assert_eq!(loaded, snapshot);
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let path = temp_path("corrupt.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();
        let err = DagSnapshot::read_from(&path).unwrap_err();
        assert!(matches!(err, KernelError::Snapshot(_)));
    }

    #[test]
    fn concurrent_writers_never_fail_or_tear() {
        let path = Arc::new(temp_path("shared.json"));
        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut errors = 0;
                    for round in 0..100 {
                        let mut snapshot = DagSnapshot::default();
                        for i in 0..20 {
                            snapshot.nodes.insert(
                                format!("w{}-r{}-n{}", writer, round, i),
                                NodeProgress {
                                    status: NodeStatus::Done,
                                    started_at: None,
                                    ended_at: None,
                                },
                            );
                        }
                        if snapshot.write_to(&path).is_err() {
                            errors += 1;
                        }
                    }
                    errors
                })
            })
            .collect();

        let errors: usize = writers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(errors, 0);
        let loaded = DagSnapshot::read_from(&path).unwrap().expect("snapshot exists");
        assert_eq!(loaded.len(), 20);
    }
}
