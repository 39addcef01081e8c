//! The task lifecycle coordinator.
//!
//! Composes store transitions with the retry policy and emits an event
//! for every state change:
//!
//! ```text
//! queued ─claim──> claimed ─ack──> running ─result(ok)──> done
//!                  │                │
//!                  │                └─result(!ok)──┬─retry──> queued
//!                  └─result(!ok)───────────────────┤
//!                                                  └─!retry─> failed + DLQ
//! queued|claimed|running ─cancel──> cancelled
//! dlq ─replay──> queued (attempt reset)
//! ```
//!
//! Timeouts follow the same failure path via the reaper with a
//! synthesized result.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use tracing::{debug, info};

use crate::auth::Identity;
use crate::clock::{Clock, IdMinter};
use crate::error::{MeshError, MeshResult};
use crate::events::{Event, EventBus, EventKind};
use crate::node::{Heartbeat, Node, NodeCapabilities, NodeId, NodeView};
use crate::retry::{compute_retry_decision, RetryConfig};
use crate::store::Store;
use crate::task::{DlqEntry, DlqReason, Task, TaskId, TaskResult, TaskSpec, TaskStatus};

/// Coordinates every externally triggered task and node transition.
pub struct Lifecycle {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdMinter>,
    retry: RetryConfig,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdMinter>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            ids,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Register (or re-register) a node. Requires the bootstrap identity.
    pub async fn register_node(
        &self,
        identity: &Identity,
        node_id: NodeId,
        capabilities: NodeCapabilities,
    ) -> MeshResult<NodeView> {
        if !matches!(identity, Identity::Bootstrap | Identity::Admin) {
            return Err(MeshError::NodeBootstrapDenied);
        }
        let view = self
            .store
            .upsert_node(Node::new(node_id.clone(), capabilities))
            .await?;
        info!(node = %node_id, "node registered");
        self.bus.emit(Event::node(
            EventKind::NodeRegistered,
            self.clock.now(),
            node_id,
        ));
        Ok(view)
    }

    /// Record a node heartbeat. The caller identity must match the node.
    pub async fn heartbeat(
        &self,
        identity: &Identity,
        node_id: &NodeId,
        heartbeat: Heartbeat,
    ) -> MeshResult<NodeView> {
        identity.require_node(node_id)?;
        let view = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| MeshError::UnknownNode(node_id.clone()))?;
        if view.node.revoked {
            // Surfaced as an error; the revocation event was already
            // emitted when the admin revoked the node.
            return Err(MeshError::NodeRevoked(node_id.clone()));
        }

        let detail = json!({
            "status": heartbeat.status,
            "load": heartbeat.load,
            "running_tasks": heartbeat.running_tasks,
        });
        self.store.set_heartbeat(node_id, heartbeat).await?;
        let view = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| MeshError::UnknownNode(node_id.clone()))?;
        self.bus.emit(
            Event::node(EventKind::NodeHeartbeat, self.clock.now(), node_id.clone())
                .with_detail(detail),
        );
        Ok(view)
    }

    /// Enqueue a task from a producer spec.
    ///
    /// Producers present a job token bound to the task id they submit; a
    /// spec carrying a different id is rejected.
    pub async fn submit_task(&self, identity: &Identity, spec: TaskSpec) -> MeshResult<Task> {
        match identity {
            Identity::Admin => {}
            Identity::Producer { task_id } => {
                if let Some(spec_id) = &spec.task_id {
                    if spec_id != task_id {
                        return Err(MeshError::TokenJobMismatch(spec_id.clone()));
                    }
                }
            }
            _ => return Err(MeshError::Unauthorized),
        }

        let task_id = match (&spec.task_id, identity) {
            (Some(id), _) => id.clone(),
            (None, Identity::Producer { task_id }) => task_id.clone(),
            (None, _) => TaskId::new(self.ids.mint()),
        };
        let now = self.clock.now();
        let task = Task::from_spec(spec, task_id, now);
        let task = self.store.enqueue_task(task).await?;

        info!(task = %task.task_id, kind = %task.kind, priority = task.priority, "task enqueued");
        self.bus.emit(
            Event::task(EventKind::TaskEnqueued, now, task.task_id.clone()).with_detail(json!({
                "kind": task.kind,
                "priority": task.priority,
            })),
        );
        Ok(task)
    }

    /// Claim the next eligible task for a node.
    pub async fn claim(&self, identity: &Identity, node_id: &NodeId) -> MeshResult<Option<Task>> {
        identity.require_node(node_id)?;
        let Some(task) = self.store.claim_task(node_id).await? else {
            return Ok(None);
        };

        let claimed_at = task.claimed_at.unwrap_or_else(|| self.clock.now());
        let latency_ms = (claimed_at - task.created_at).num_milliseconds().max(0);
        debug!(task = %task.task_id, node = %node_id, attempt = task.attempt, "task claimed");
        self.bus.emit(
            Event::task(EventKind::TaskClaimed, claimed_at, task.task_id.clone())
                .with_node(node_id.clone())
                .with_detail(json!({
                    "attempt": task.attempt,
                    "latency_ms": latency_ms,
                })),
        );
        Ok(Some(task))
    }

    /// Acknowledge a claimed task: the assigned node confirms it started.
    pub async fn ack(&self, identity: &Identity, task_id: &TaskId) -> MeshResult<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| MeshError::TaskNotFound(task_id.clone()))?;

        match task.status {
            TaskStatus::Cancelled => {
                // The worker raced an admin cancel; nothing comes back.
                self.bus.bump("late_ack_ignored");
                debug!(task = %task_id, "ack after cancel ignored");
                Ok(task)
            }
            TaskStatus::Claimed => {
                self.require_assigned(identity, &task)?;
                let assigned = task.assigned_node_id.clone();
                let task = self.store.set_task_status(task_id, TaskStatus::Running).await?;
                let mut event =
                    Event::task(EventKind::TaskRunning, self.clock.now(), task_id.clone());
                if let Some(node_id) = assigned {
                    event = event.with_node(node_id);
                }
                self.bus.emit(event);
                Ok(task)
            }
            TaskStatus::Running => {
                // Duplicate ack from the owner is harmless.
                self.require_assigned(identity, &task)?;
                Ok(task)
            }
            TaskStatus::Done | TaskStatus::Failed => {
                Err(MeshError::TaskAlreadyTerminal(task_id.clone()))
            }
            // No node holds the lease; whoever is acking lost it.
            TaskStatus::Queued => match identity {
                Identity::Node(id) => Err(MeshError::TokenNodeMismatch(id.clone())),
                _ => Err(MeshError::Unauthorized),
            },
        }
    }

    /// Record a terminal outcome from the assigned node.
    ///
    /// Failures consult the retry policy: either the task is requeued with
    /// a backoff gate, or it is failed and dead-lettered. Late results for
    /// cancelled or already terminal tasks are ignored.
    pub async fn report_result(&self, identity: &Identity, result: TaskResult) -> MeshResult<()> {
        identity.require_node(&result.node_id)?;

        let task = self
            .store
            .get_task(&result.task_id)
            .await?
            .ok_or_else(|| MeshError::TaskNotFound(result.task_id.clone()))?;

        if task.status.is_terminal() || task.status == TaskStatus::Queued {
            // Cancelled, already resolved, or the lease lapsed and the
            // task went back to the queue. The late result changes nothing.
            self.bus.bump("late_result_ignored");
            debug!(task = %result.task_id, status = %task.status, "late result ignored");
            return Ok(());
        }

        if task.assigned_node_id.as_ref() != Some(&result.node_id) {
            return Err(MeshError::TokenNodeMismatch(result.node_id));
        }

        if result.ok {
            self.store.set_task_result(result.clone()).await?;
            self.store
                .set_task_status(&result.task_id, TaskStatus::Done)
                .await?;
            info!(task = %result.task_id, node = %result.node_id, "task done");
            self.bus.emit(
                Event::task(EventKind::TaskDone, self.clock.now(), result.task_id)
                    .with_node(result.node_id),
            );
            return Ok(());
        }

        self.fail_attempt(task, Some(result), "error").await?;
        Ok(())
    }

    /// Shared failure path for worker-reported errors and reaper timeouts.
    /// Returns `true` when the attempt was requeued for retry.
    pub(crate) async fn fail_attempt(
        &self,
        task: Task,
        result: Option<TaskResult>,
        reason: &str,
    ) -> MeshResult<bool> {
        let now = self.clock.now();
        let decision = compute_retry_decision(task.attempt, task.max_attempts, &self.retry);

        if decision.retry {
            let retry_after = now + Duration::milliseconds(decision.delay_ms as i64);
            self.store
                .requeue_for_retry(&task.task_id, retry_after)
                .await?;
            info!(
                task = %task.task_id,
                attempt = task.attempt,
                delay_ms = decision.delay_ms,
                reason,
                "attempt failed, retrying"
            );
            self.bus.emit(
                Event::task(EventKind::TaskFailed, now, task.task_id.clone()).with_detail(json!({
                    "reason": reason,
                    "retrying": true,
                    "attempt": task.attempt,
                    "retry_delay_ms": decision.delay_ms,
                })),
            );
            return Ok(true);
        }

        let dlq_reason = if reason == "timeout" {
            DlqReason::Timeout
        } else {
            DlqReason::MaxAttemptsExhausted
        };

        if let Some(result) = &result {
            self.store.set_task_result(result.clone()).await?;
        }
        let failed = self
            .store
            .set_task_status(&task.task_id, TaskStatus::Failed)
            .await?;
        self.store
            .enqueue_dlq(DlqEntry {
                task_id: failed.task_id.clone(),
                task: failed,
                last_result: result,
                reason: dlq_reason,
                enqueued_at: now,
            })
            .await?;
        info!(task = %task.task_id, attempt = task.attempt, reason, "task failed, dead-lettered");
        self.bus.emit(
            Event::task(EventKind::TaskFailed, now, task.task_id.clone()).with_detail(json!({
                "reason": reason,
                "retrying": false,
                "to_dlq": true,
                "attempt": task.attempt,
            })),
        );
        Ok(false)
    }

    /// Cancel a task. Admin only; terminal tasks are a named conflict.
    pub async fn cancel(&self, identity: &Identity, task_id: &TaskId) -> MeshResult<Task> {
        identity.require_admin()?;
        if !self.store.cancel_task(task_id).await? {
            return Err(MeshError::TaskAlreadyTerminal(task_id.clone()));
        }
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| MeshError::TaskNotFound(task_id.clone()))?;
        info!(task = %task_id, "task cancelled");
        self.bus.emit(Event::task(
            EventKind::TaskCancelled,
            self.clock.now(),
            task_id.clone(),
        ));
        Ok(task)
    }

    /// Restore a dead-lettered task to the queue with its attempt counter
    /// reset.
    pub async fn replay_dlq(&self, identity: &Identity, task_id: &TaskId) -> MeshResult<Task> {
        identity.require_admin()?;
        let task = self.store.requeue_from_dlq(task_id).await?;
        info!(task = %task_id, "dead-letter entry replayed");
        self.bus.emit(
            Event::task(EventKind::TaskEnqueued, self.clock.now(), task_id.clone()).with_detail(
                json!({
                    "kind": task.kind,
                    "priority": task.priority,
                    "replayed": true,
                }),
            ),
        );
        Ok(task)
    }

    fn require_assigned(&self, identity: &Identity, task: &Task) -> MeshResult<()> {
        let assigned = task
            .assigned_node_id
            .as_ref()
            .ok_or_else(|| MeshError::TaskNotFound(task.task_id.clone()))?;
        identity.require_node(assigned)
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
