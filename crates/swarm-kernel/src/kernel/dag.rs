//! Execution DAG: dependency-ordered work items driven by the current lease holder.
//!
//! The graph is deliberately permissive. Dependency and causal-gate ids are not checked
//! for existence or cycles when a node is added; an id that never appears simply keeps
//! the dependent node out of [ExecutionDag::ready_nodes] forever. Use
//! [ExecutionDag::unresolved_references] to find such stalls.
//!
//! Status writes (`mark_*`) are unguarded: the caller drives
//! pending -> running -> done | failed, and may mark a node skipped at any point.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::identity::NodeId;
use crate::kernel::snapshot::{DagSnapshot, NodeProgress};
use crate::kernel::KernelError;

/// Lifecycle state of a DAG node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// True for states that no longer block [ExecutionDag::is_complete].
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Done => "done",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }
}

/// Out-of-band preconditions and free-form labels attached to a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CausalMetadata {
    /// Node ids that must be done before the node may run, in addition to `depends_on`.
    #[serde(default)]
    pub requires_nodes_done: Vec<NodeId>,
    #[serde(default, flatten)]
    pub labels: BTreeMap<String, Value>,
}

impl CausalMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requires_done<I, S>(mut self, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.requires_nodes_done
            .extend(node_ids.into_iter().map(Into::into));
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: Value) -> Self {
        self.labels.insert(key.into(), value);
        self
    }
}

/// A single work item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub node_id: NodeId,
    pub depends_on: BTreeSet<NodeId>,
    pub status: NodeStatus,
    pub result: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub causal_metadata: CausalMetadata,
}

impl DagNode {
    fn pending(node_id: NodeId, depends_on: BTreeSet<NodeId>, causal: CausalMetadata) -> Self {
        Self {
            node_id,
            depends_on,
            status: NodeStatus::Pending,
            result: None,
            started_at: None,
            ended_at: None,
            causal_metadata: causal,
        }
    }

    fn progress(&self) -> NodeProgress {
        NodeProgress {
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Dependency graph of work items, keyed by node id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDag {
    nodes: BTreeMap<NodeId, DagNode>,
}

impl ExecutionDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pending node. Re-adding an existing id replaces it, progress included.
    pub fn add_node(&mut self, node_id: &str, depends_on: &[&str]) {
        self.add_node_with_metadata(node_id, depends_on, CausalMetadata::default());
    }

    pub fn add_node_with_metadata(
        &mut self,
        node_id: &str,
        depends_on: &[&str],
        causal_metadata: CausalMetadata,
    ) {
        let deps = depends_on.iter().map(|dep| dep.to_string()).collect();
        self.nodes.insert(
            node_id.to_string(),
            DagNode::pending(node_id.to_string(), deps, causal_metadata),
        );
    }

    pub fn node(&self, node_id: &str) -> Option<&DagNode> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pending nodes whose every dependency exists and is done, in node-id order.
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.status == NodeStatus::Pending)
            .filter(|node| node.depends_on.iter().all(|dep| self.is_done(dep)))
            .map(|node| node.node_id.clone())
            .collect()
    }

    pub fn mark_running(&mut self, node_id: &str) -> bool {
        self.update(node_id, |node| {
            node.status = NodeStatus::Running;
            node.started_at = Some(Utc::now());
        })
    }

    pub fn mark_done(&mut self, node_id: &str, result: Value) -> bool {
        self.update(node_id, |node| {
            node.status = NodeStatus::Done;
            node.result = Some(result);
            node.ended_at = Some(Utc::now());
        })
    }

    pub fn mark_failed(&mut self, node_id: &str, reason: &str) -> bool {
        self.update(node_id, |node| {
            node.status = NodeStatus::Failed;
            node.result = Some(serde_json::json!({ "error": reason }));
            node.ended_at = Some(Utc::now());
        })
    }

    pub fn mark_skipped(&mut self, node_id: &str) -> bool {
        self.update(node_id, |node| {
            node.status = NodeStatus::Skipped;
            node.ended_at = Some(Utc::now());
        })
    }

    /// Checks the node's `requires_nodes_done` gates. Structural dependencies are not
    /// consulted; a node can pass its causal gates while still waiting on `depends_on`.
    pub fn check_causal_gate(&self, node_id: &str) -> (bool, String) {
        let Some(node) = self.nodes.get(node_id) else {
            return (false, format!("node {} not found", node_id));
        };
        for required in &node.causal_metadata.requires_nodes_done {
            if !self.is_done(required) {
                return (false, format!("{} not done", required));
            }
        }
        (true, "all causal gates passed".to_string())
    }

    /// True when no node is pending or running.
    pub fn is_complete(&self) -> bool {
        self.nodes.values().all(|node| node.status.is_terminal())
    }

    /// Captures status and timestamps of every node.
    pub fn save_state(&self) -> DagSnapshot {
        DagSnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|(id, node)| (id.clone(), node.progress()))
                .collect(),
        }
    }

    /// Overlays a snapshot onto the graph. Ids unknown to this graph are ignored and
    /// nodes absent from the snapshot are left untouched. Returns the number restored.
    pub fn load_state(&mut self, snapshot: &DagSnapshot) -> usize {
        let mut restored = 0;
        for (node_id, progress) in &snapshot.nodes {
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.status = progress.status;
                node.started_at = progress.started_at;
                node.ended_at = progress.ended_at;
                restored += 1;
            }
        }
        restored
    }

    pub fn save_state_to_path(&self, path: &Path) -> Result<(), KernelError> {
        self.save_state().write_to(path)
    }

    /// Loads and applies a snapshot file; a missing file restores nothing.
    pub fn load_state_from_path(&mut self, path: &Path) -> Result<usize, KernelError> {
        Ok(DagSnapshot::read_from(path)?
            .map(|snapshot| self.load_state(&snapshot))
            .unwrap_or(0))
    }

    /// Puts nodes left `running` by an interrupted driver back to `pending` so they are
    /// offered again. Returns the requeued ids.
    pub fn requeue_interrupted(&mut self) -> Vec<NodeId> {
        let mut requeued = Vec::new();
        for node in self.nodes.values_mut() {
            if node.status == NodeStatus::Running {
                node.status = NodeStatus::Pending;
                node.started_at = None;
                requeued.push(node.node_id.clone());
            }
        }
        requeued
    }

    /// `(node_id, missing_id)` pairs for dependencies and causal gates that were never
    /// registered. Inspection only; readiness is unaffected.
    pub fn unresolved_references(&self) -> Vec<(NodeId, NodeId)> {
        let mut missing = Vec::new();
        for node in self.nodes.values() {
            let referenced = node
                .depends_on
                .iter()
                .chain(node.causal_metadata.requires_nodes_done.iter());
            for reference in referenced {
                if !self.nodes.contains_key(reference) {
                    missing.push((node.node_id.clone(), reference.clone()));
                }
            }
        }
        missing
    }

    pub fn status_counts(&self) -> BTreeMap<NodeStatus, usize> {
        let mut counts = BTreeMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }

    fn is_done(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .map(|node| node.status == NodeStatus::Done)
            .unwrap_or(false)
    }

    fn update(&mut self, node_id: &str, apply: impl FnOnce(&mut DagNode)) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                apply(node);
                log::debug!("dag node {} -> {}", node_id, node.status.as_str());
                true
            }
            None => false,
        }
    }
}
