//! The single authoritative state holder.
//!
//! Everything the scheduler knows — nodes, tasks, results, the dead-letter
//! queue — lives behind [`Store`]. The trait is narrow on purpose: the
//! lifecycle coordinator, claim engine, and reaper compose these
//! primitives and never reach around them.
//!
//! # Atomicity contract
//!
//! `claim_task`, `requeue_for_retry`, `cancel_task`, and
//! `requeue_from_dlq` are atomic with respect to concurrent callers: no
//! intermediate state is observable by another `claim_task` or
//! `set_task_status`. The memory backend holds a single critical section
//! per operation. The postgres backend uses compare-and-set updates; see
//! its module docs for the multi-instance caveat.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MeshResult;
use crate::node::{Heartbeat, Node, NodeId, NodeView};
use crate::task::{DlqEntry, Task, TaskId, TaskResult, TaskStatus};

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Authoritative state operations. All node reads return views with the
/// freshness computed against the store's clock.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create or replace a node's capabilities. Preserves the last
    /// heartbeat and the trust/drain flags of an existing node.
    async fn upsert_node(&self, node: Node) -> MeshResult<NodeView>;

    /// Record a heartbeat. Fails with `unknown_node` if absent.
    async fn set_heartbeat(&self, node_id: &NodeId, heartbeat: Heartbeat) -> MeshResult<()>;

    /// Partial trust update. Fails with `unknown_node` if absent.
    async fn set_node_trust(
        &self,
        node_id: &NodeId,
        trusted: Option<bool>,
        revoked: Option<bool>,
    ) -> MeshResult<NodeView>;

    /// Set the drain flag. Fails with `unknown_node` if absent.
    async fn set_node_drain(&self, node_id: &NodeId, draining: bool) -> MeshResult<NodeView>;

    async fn get_node(&self, node_id: &NodeId) -> MeshResult<Option<NodeView>>;

    async fn list_nodes(&self) -> MeshResult<Vec<NodeView>>;

    /// Insert a queued task and append it to the queue ordering structure.
    async fn enqueue_task(&self, task: Task) -> MeshResult<Task>;

    /// Atomically select and claim at most one eligible task for the node.
    ///
    /// Performs lease recovery, the node/capacity gates, eligibility
    /// filtering, priority + FIFO selection, and the claim transition in
    /// one atomic scope. Returns `None` when nothing is claimable — that
    /// is not an error.
    async fn claim_task(&self, node_id: &NodeId) -> MeshResult<Option<Task>>;

    async fn get_task(&self, task_id: &TaskId) -> MeshResult<Option<Task>>;

    /// Snapshot of every task the store knows about.
    async fn list_tasks(&self) -> MeshResult<Vec<Task>>;

    /// Transition to `running`, `done`, or `failed`. Clears the claim
    /// fields on any transition into a terminal status.
    async fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) -> MeshResult<Task>;

    /// Cancel a task. Returns `false` if it is already terminal, `true`
    /// after transitioning to `cancelled` and removing it from the queue.
    async fn cancel_task(&self, task_id: &TaskId) -> MeshResult<bool>;

    /// Move a claimed/running task back to the queue for a later retry:
    /// clears the claim fields, preserves `attempt`, sets `retry_after`.
    async fn requeue_for_retry(
        &self,
        task_id: &TaskId,
        retry_after: DateTime<Utc>,
    ) -> MeshResult<Task>;

    /// Record the one terminal result for a task. A second write for the
    /// same task fails with `task_already_terminal`.
    async fn set_task_result(&self, result: TaskResult) -> MeshResult<()>;

    async fn get_task_result(&self, task_id: &TaskId) -> MeshResult<Option<TaskResult>>;

    async fn enqueue_dlq(&self, entry: DlqEntry) -> MeshResult<()>;

    async fn list_dlq(&self) -> MeshResult<Vec<DlqEntry>>;

    async fn get_dlq_entry(&self, task_id: &TaskId) -> MeshResult<Option<DlqEntry>>;

    /// Remove a dead-letter entry and restore its task to the queue with
    /// `attempt = 0` and `retry_after` cleared. Fails with
    /// `dlq_entry_not_found`.
    async fn requeue_from_dlq(&self, task_id: &TaskId) -> MeshResult<Task>;
}
