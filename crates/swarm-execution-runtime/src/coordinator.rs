//! Coordinator: one node's view of the kernel.
//!
//! Ties the lease, the epoch fence, the decision table and the observer together for a
//! single node id. Every call leaves a [CoordinatorEvent] in the observer, and DAG
//! transitions only happen through the fence, so a node that lost the lease cannot move
//! the graph forward.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use swarm_governor::{
    DecisionEngine, DecisionTable, Facts, GovernorError, PolicyDecision, PolicyRule,
};
use swarm_kernel::dag::{DagNode, ExecutionDag};
use swarm_kernel::event::KernelError;
use swarm_kernel::identity::{Epoch, HolderId, NodeId};
use swarm_kernel::observer::CoordinatorObserver;

use super::backend_config::LeaseConfig;
use super::fence::{EpochFence, FenceRole, FencedResult};
use super::lease::LeaseManager;
use super::models::{AcquireResult, EpochToken, LeaseError, LeaseOutcome};

/// DAG status change applied by [Coordinator::advance_dag].
#[derive(Clone, Debug, PartialEq)]
pub enum DagTransition {
    Running,
    Done(Value),
    Failed(String),
    Skipped,
}

impl DagTransition {
    fn as_str(&self) -> &'static str {
        match self {
            DagTransition::Running => "running",
            DagTransition::Done(_) => "done",
            DagTransition::Failed(_) => "failed",
            DagTransition::Skipped => "skipped",
        }
    }

    fn apply(self, dag: &mut ExecutionDag, node_id: &str) -> bool {
        match self {
            DagTransition::Running => dag.mark_running(node_id),
            DagTransition::Done(result) => dag.mark_done(node_id, result),
            DagTransition::Failed(reason) => dag.mark_failed(node_id, &reason),
            DagTransition::Skipped => dag.mark_skipped(node_id),
        }
    }
}

/// What a [Coordinator::drive_dag] pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagRunSummary {
    pub completed: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    /// Ready nodes held back by an unsatisfied causal gate.
    pub gated: Vec<NodeId>,
    /// True when the pass stopped because the epoch was no longer valid.
    pub fenced: bool,
    /// Set when the pass stopped because the snapshot could not be persisted. The node
    /// whose transition failed to persist is in neither `completed` nor `failed`.
    pub persist_error: Option<String>,
    /// Every node is terminal and the last transition was persisted.
    pub complete: bool,
}

pub struct Coordinator {
    node_id: HolderId,
    lease: Arc<dyn LeaseManager>,
    fence: EpochFence,
    policy: DecisionTable,
    observer: Arc<CoordinatorObserver>,
    held: Mutex<Option<EpochToken>>,
}

impl Coordinator {
    /// Builds the configured backend for `config.node_id`.
    pub fn new(config: &LeaseConfig) -> Self {
        let backend: Arc<dyn LeaseManager> = Arc::new(config.build_backend());
        Self::with_lease(config.node_id.clone(), backend, config.observer_max_events)
    }

    pub fn with_lease(
        node_id: impl Into<HolderId>,
        lease: Arc<dyn LeaseManager>,
        max_events: usize,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            fence: EpochFence::new(lease.clone(), node_id.clone()),
            node_id,
            lease,
            policy: DecisionTable::new(),
            observer: Arc::new(CoordinatorObserver::new(max_events)),
            held: Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: DecisionTable) -> Self {
        self.policy = policy;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn lease(&self) -> &Arc<dyn LeaseManager> {
        &self.lease
    }

    pub fn observer(&self) -> &Arc<CoordinatorObserver> {
        &self.observer
    }

    pub fn policy(&self) -> &DecisionTable {
        &self.policy
    }

    /// The token from the last successful heartbeat, if still held.
    pub fn epoch_token(&self) -> Option<EpochToken> {
        self.held_token().clone()
    }

    /// Acquires or renews the lease for this node.
    pub fn heartbeat(&self) -> Result<AcquireResult, LeaseError> {
        match self.lease.acquire_or_renew(&self.node_id) {
            Ok(result) => {
                *self.held_token() = result.token.clone();
                self.observer
                    .record(heartbeat_event(result.outcome), self.lease_detail(&result));
                Ok(result)
            }
            Err(err) => {
                *self.held_token() = None;
                self.observer.record(
                    "lease.error",
                    json!({
                        "node_id": self.node_id,
                        "backend": self.lease.backend_name(),
                        "error": err.to_string(),
                    }),
                );
                Err(err)
            }
        }
    }

    /// Releases the lease if this node holds it.
    pub fn release(&self) -> Result<AcquireResult, LeaseError> {
        let epoch = self.held_token().as_ref().map(|t| t.epoch).unwrap_or(0);
        let result = self.lease.release(&self.node_id, epoch)?;
        if result.outcome == LeaseOutcome::Released {
            *self.held_token() = None;
        }
        self.observer.record(
            format!("lease.{}", result.outcome.as_str()),
            self.lease_detail(&result),
        );
        Ok(result)
    }

    pub fn role(&self) -> FenceRole {
        let held = self.held_token().as_ref().map(|t| t.epoch);
        self.fence.role(held)
    }

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
        let result = self.fence.fenced_execute(epoch, action, operation);
        let event_type = if result.fenced {
            "fence.rejected"
        } else if result.ok {
            "fence.executed"
        } else {
            "fence.operation_failed"
        };
        self.observer.record(
            event_type,
            json!({
                "node_id": self.node_id,
                "action": action,
                "epoch": epoch,
                "reason": result.reason,
            }),
        );
        result
    }

    pub fn add_policy_rule(&mut self, rule: PolicyRule) -> Result<(), GovernorError> {
        self.policy.add_rule(rule)
    }

    pub fn evaluate_policy(&self, facts: &Facts) -> PolicyDecision {
        let decision = self.policy.evaluate(facts);
        self.observer.record(
            "policy.evaluated",
            json!({
                "matched_rule_id": decision.matched_rule_id,
                "action": decision.action,
                "explain": decision.explain,
            }),
        );
        decision
    }

    /// Applies one fenced status change and, when `snapshot_path` is set, persists the
    /// DAG state before returning. `result` is whether the node existed.
    pub fn advance_dag(
        &self,
        epoch: Epoch,
        dag: &mut ExecutionDag,
        node_id: &str,
        transition: DagTransition,
        snapshot_path: Option<&Path>,
    ) -> FencedResult<bool> {
        let label = transition.as_str();
        let action = format!("dag.{}:{}", label, node_id);
        let result = self.fence.fenced_execute(epoch, &action, || {
            let known = transition.apply(dag, node_id);
            if let Some(path) = snapshot_path {
                dag.save_state_to_path(path)?;
            }
            Ok::<_, KernelError>(known)
        });
        let event_type = if result.fenced {
            "fence.rejected".to_string()
        } else {
            format!("dag.{}", label)
        };
        self.observer.record(
            event_type,
            json!({
                "node_id": node_id,
                "epoch": epoch,
                "ok": result.ok,
                "reason": result.reason,
            }),
        );
        result
    }

    /// Runs every ready node whose causal gates pass, in id order, until nothing more
    /// can run, the epoch is fenced, or a snapshot write fails. `run` is called under the
    /// fence; an `Err` marks the node failed.
    pub fn drive_dag<F>(
        &self,
        epoch: Epoch,
        dag: &mut ExecutionDag,
        snapshot_path: Option<&Path>,
        mut run: F,
    ) -> DagRunSummary
    where
        F: FnMut(&DagNode) -> Result<Value, String>,
    {
        let mut summary = DagRunSummary::default();
        loop {
            let mut progressed = false;
            summary.gated.clear();
            for node_id in dag.ready_nodes() {
                let (passed, reason) = dag.check_causal_gate(&node_id);
                if !passed {
                    log::debug!("dag node {} gated: {}", node_id, reason);
                    summary.gated.push(node_id);
                    continue;
                }
                let Some(node) = dag.node(&node_id).cloned() else {
                    continue;
                };

                let started =
                    self.advance_dag(epoch, dag, &node_id, DagTransition::Running, snapshot_path);
                if started.fenced {
                    summary.fenced = true;
                    return self.finish_drive(dag, summary);
                }
                if !started.ok {
                    // Not started on an unpersisted mark; left running for resume.
                    summary.persist_error = started.reason;
                    return self.finish_drive(dag, summary);
                }

                let outcome = self.fenced_execute(epoch, &format!("dag.run:{}", node_id), || {
                    run(&node)
                });
                if outcome.fenced {
                    // Left running; a later resume requeues it.
                    summary.fenced = true;
                    return self.finish_drive(dag, summary);
                }
                let transition = match (outcome.result, outcome.reason) {
                    (Some(value), _) => DagTransition::Done(value),
                    (None, reason) => DagTransition::Failed(reason.unwrap_or_default()),
                };
                let failed = matches!(transition, DagTransition::Failed(_));
                let ended = self.advance_dag(epoch, dag, &node_id, transition, snapshot_path);
                if ended.fenced {
                    summary.fenced = true;
                    return self.finish_drive(dag, summary);
                }
                if !ended.ok {
                    summary.persist_error = ended.reason;
                    return self.finish_drive(dag, summary);
                }
                if failed {
                    summary.failed.push(node_id);
                } else {
                    summary.completed.push(node_id);
                }
                progressed = true;
            }
            if !progressed {
                return self.finish_drive(dag, summary);
            }
        }
    }

    /// Restores DAG progress from `snapshot_path` and requeues nodes that were running
    /// when the previous driver stopped. Returns the number of nodes restored.
    pub fn resume_dag(
        &self,
        dag: &mut ExecutionDag,
        snapshot_path: &Path,
    ) -> Result<usize, KernelError> {
        let restored = dag.load_state_from_path(snapshot_path)?;
        let requeued = dag.requeue_interrupted();
        self.observer.record(
            "dag.resumed",
            json!({
                "node_id": self.node_id,
                "restored": restored,
                "requeued": requeued,
                "unresolved": dag.unresolved_references(),
            }),
        );
        Ok(restored)
    }

    /// Writes the observer buffer to `path`.
    pub fn flush_events(&self, path: &Path) -> Result<(), KernelError> {
        self.observer.flush_to_file(path)
    }

    fn finish_drive(&self, dag: &ExecutionDag, mut summary: DagRunSummary) -> DagRunSummary {
        summary.complete = dag.is_complete() && summary.persist_error.is_none();
        self.observer.record(
            "dag.drive_finished",
            json!({
                "node_id": self.node_id,
                "completed": summary.completed,
                "failed": summary.failed,
                "gated": summary.gated,
                "fenced": summary.fenced,
                "persist_error": summary.persist_error,
                "complete": summary.complete,
            }),
        );
        summary
    }

    fn lease_detail(&self, result: &AcquireResult) -> Value {
        json!({
            "node_id": self.node_id,
            "backend": self.lease.backend_name(),
            "outcome": result.outcome.as_str(),
            "is_leader": result.is_leader,
            "epoch": result.epoch(),
            "holder_id": result.snapshot.holder_id,
            "fallback_backend": result.fallback_backend,
            "reason": result.reason,
        })
    }

    fn held_token(&self) -> MutexGuard<'_, Option<EpochToken>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn heartbeat_event(outcome: LeaseOutcome) -> &'static str {
    match outcome {
        LeaseOutcome::Acquired | LeaseOutcome::FallbackAcquired => "lease.acquired",
        LeaseOutcome::Renewed | LeaseOutcome::FallbackRenewed => "lease.renewed",
        LeaseOutcome::ObserverMode => "lease.observer_mode",
        _ => "lease.follower",
    }
}
