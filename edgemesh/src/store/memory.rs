use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::claim;
use crate::clock::Clock;
use crate::error::{MeshError, MeshResult};
use crate::node::{FreshnessThresholds, Heartbeat, Node, NodeId, NodeView};
use crate::store::Store;
use crate::task::{DlqEntry, Task, TaskId, TaskResult, TaskStatus};

/// Process-local store backend.
///
/// All state sits behind one mutex; every operation takes the lock once
/// and releases it before returning, which is what makes `claim_task`
/// linearizable across concurrent callers in this backend.
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    freshness: FreshnessThresholds,
    claim_ttl_ms: u64,
}

#[derive(Default)]
struct State {
    nodes: HashMap<NodeId, Node>,
    tasks: HashMap<TaskId, Task>,
    /// Queue ordering structure: task ids in enqueue order. Selection
    /// sorts by priority first, so this only preserves FIFO arrival.
    queue: Vec<TaskId>,
    results: HashMap<TaskId, TaskResult>,
    dlq: HashMap<TaskId, DlqEntry>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>, freshness: FreshnessThresholds, claim_ttl_ms: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            freshness,
            claim_ttl_ms,
        }
    }

    fn view(&self, node: Node, now: DateTime<Utc>) -> NodeView {
        NodeView::of(node, now, &self.freshness)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("nodes", &state.nodes.len())
            .field("tasks", &state.tasks.len())
            .field("queued", &state.queue.len())
            .field("dlq", &state.dlq.len())
            .field("claim_ttl_ms", &self.claim_ttl_ms)
            .finish()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_node(&self, node: Node) -> MeshResult<NodeView> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let stored = match state.nodes.entry(node.node_id.clone()) {
            Entry::Occupied(mut occupied) => {
                // Re-registration replaces what the node offers but keeps
                // what the control plane knows about it.
                occupied.get_mut().capabilities = node.capabilities;
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => vacant.insert(node).clone(),
        };

        Ok(self.view(stored, now))
    }

    async fn set_heartbeat(&self, node_id: &NodeId, heartbeat: Heartbeat) -> MeshResult<()> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::UnknownNode(node_id.clone()))?;
        node.last_heartbeat = Some(heartbeat);
        Ok(())
    }

    async fn set_node_trust(
        &self,
        node_id: &NodeId,
        trusted: Option<bool>,
        revoked: Option<bool>,
    ) -> MeshResult<NodeView> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::UnknownNode(node_id.clone()))?;
        if let Some(trusted) = trusted {
            node.trusted = trusted;
        }
        if let Some(revoked) = revoked {
            node.revoked = revoked;
        }
        let node = node.clone();
        Ok(self.view(node, now))
    }

    async fn set_node_drain(&self, node_id: &NodeId, draining: bool) -> MeshResult<NodeView> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::UnknownNode(node_id.clone()))?;
        node.draining = draining;
        let node = node.clone();
        Ok(self.view(node, now))
    }

    async fn get_node(&self, node_id: &NodeId) -> MeshResult<Option<NodeView>> {
        let now = self.clock.now();
        let state = self.state.lock();
        Ok(state
            .nodes
            .get(node_id)
            .map(|node| self.view(node.clone(), now)))
    }

    async fn list_nodes(&self) -> MeshResult<Vec<NodeView>> {
        let now = self.clock.now();
        let state = self.state.lock();
        let mut views: Vec<NodeView> = state
            .nodes
            .values()
            .map(|node| self.view(node.clone(), now))
            .collect();
        views.sort_by(|a, b| a.node.node_id.cmp(&b.node.node_id));
        Ok(views)
    }

    async fn enqueue_task(&self, task: Task) -> MeshResult<Task> {
        let mut state = self.state.lock();
        state.queue.push(task.task_id.clone());
        state.tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    async fn claim_task(&self, node_id: &NodeId) -> MeshResult<Option<Task>> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        // Lease recovery: stale claims go back to the queue with their
        // attempt count intact. This runs before the node gate so a
        // rejected caller still frees work for everyone else.
        let expired: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|task| claim::claim_expired(task, now, self.claim_ttl_ms))
            .map(|task| task.task_id.clone())
            .collect();
        for task_id in expired {
            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.status = TaskStatus::Queued;
                task.claimed_at = None;
                task.assigned_node_id = None;
            }
            state.queue.push(task_id);
        }

        let Some(node) = state.nodes.get(node_id).cloned() else {
            return Ok(None);
        };
        let view = self.view(node.clone(), now);
        if !claim::node_claimable(&view) {
            return Ok(None);
        }

        let in_flight = state
            .tasks
            .values()
            .filter(|task| {
                task.status.is_in_flight() && task.assigned_node_id.as_ref() == Some(node_id)
            })
            .count();
        if in_flight >= node.capabilities.max_concurrent_tasks as usize {
            return Ok(None);
        }

        let mut candidates: Vec<&Task> = state
            .queue
            .iter()
            .filter_map(|task_id| state.tasks.get(task_id))
            .filter(|task| claim::is_eligible(task, &node, now))
            .collect();
        candidates.sort_by(|a, b| claim::candidate_order(a, b));

        let Some(head) = candidates.first().map(|task| task.task_id.clone()) else {
            return Ok(None);
        };

        state.queue.retain(|task_id| task_id != &head);
        let task = state
            .tasks
            .get_mut(&head)
            .expect("queued task present in task map");
        task.status = TaskStatus::Claimed;
        task.claimed_at = Some(now);
        task.assigned_node_id = Some(node_id.clone());
        task.attempt += 1;
        Ok(Some(task.clone()))
    }

    async fn get_task(&self, task_id: &TaskId) -> MeshResult<Option<Task>> {
        let state = self.state.lock();
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self) -> MeshResult<Vec<Task>> {
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        Ok(tasks)
    }

    async fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) -> MeshResult<Task> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.clone()))?;
        if task.status.is_terminal() {
            return Err(MeshError::TaskAlreadyTerminal(task_id.clone()));
        }
        task.status = status;
        if status.is_terminal() {
            task.claimed_at = None;
            task.assigned_node_id = None;
        }
        let task = task.clone();
        if status.is_terminal() {
            state.queue.retain(|queued| queued != task_id);
        }
        Ok(task)
    }

    async fn cancel_task(&self, task_id: &TaskId) -> MeshResult<bool> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.clone()))?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.claimed_at = None;
        task.assigned_node_id = None;
        state.queue.retain(|queued| queued != task_id);
        Ok(true)
    }

    async fn requeue_for_retry(
        &self,
        task_id: &TaskId,
        retry_after: DateTime<Utc>,
    ) -> MeshResult<Task> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.clone()))?;
        if !task.status.is_in_flight() {
            return Err(MeshError::Storage(anyhow::anyhow!(
                "requeue_for_retry on {} task {task_id}",
                task.status
            )));
        }
        task.status = TaskStatus::Queued;
        task.claimed_at = None;
        task.assigned_node_id = None;
        task.retry_after = Some(retry_after);
        let task = task.clone();
        state.queue.push(task_id.clone());
        Ok(task)
    }

    async fn set_task_result(&self, result: TaskResult) -> MeshResult<()> {
        let mut state = self.state.lock();
        if state.results.contains_key(&result.task_id) {
            return Err(MeshError::TaskAlreadyTerminal(result.task_id.clone()));
        }
        state.results.insert(result.task_id.clone(), result);
        Ok(())
    }

    async fn get_task_result(&self, task_id: &TaskId) -> MeshResult<Option<TaskResult>> {
        let state = self.state.lock();
        Ok(state.results.get(task_id).cloned())
    }

    async fn enqueue_dlq(&self, entry: DlqEntry) -> MeshResult<()> {
        let mut state = self.state.lock();
        state.dlq.insert(entry.task_id.clone(), entry);
        Ok(())
    }

    async fn list_dlq(&self) -> MeshResult<Vec<DlqEntry>> {
        let state = self.state.lock();
        let mut entries: Vec<DlqEntry> = state.dlq.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(entries)
    }

    async fn get_dlq_entry(&self, task_id: &TaskId) -> MeshResult<Option<DlqEntry>> {
        let state = self.state.lock();
        Ok(state.dlq.get(task_id).cloned())
    }

    async fn requeue_from_dlq(&self, task_id: &TaskId) -> MeshResult<Task> {
        let mut state = self.state.lock();
        let entry = state
            .dlq
            .remove(task_id)
            .ok_or_else(|| MeshError::DlqEntryNotFound(task_id.clone()))?;

        let mut task = entry.task;
        task.status = TaskStatus::Queued;
        task.attempt = 0;
        task.retry_after = None;
        task.claimed_at = None;
        task.assigned_node_id = None;

        state.tasks.insert(task_id.clone(), task.clone());
        state.queue.push(task_id.clone());
        state.results.remove(task_id);
        Ok(task)
    }
}
