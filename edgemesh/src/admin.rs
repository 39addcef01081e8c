//! Admin operations: node drain/undrain/revoke, task cancel, DLQ replay,
//! and job-token issuance. Thin compositions over the store, the
//! lifecycle coordinator, and the event bus, all gated on the admin
//! identity.

use std::sync::Arc;

use tracing::info;

use crate::auth::{Identity, TokenService};
use crate::clock::Clock;
use crate::error::MeshResult;
use crate::events::{Event, EventBus, EventKind};
use crate::lifecycle::Lifecycle;
use crate::node::{NodeId, NodeView};
use crate::store::Store;
use crate::task::{Task, TaskId};

pub struct Admin {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    lifecycle: Arc<Lifecycle>,
    tokens: Arc<TokenService>,
}

impl Admin {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        lifecycle: Arc<Lifecycle>,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            lifecycle,
            tokens,
        }
    }

    /// Stop handing new work to a node. In-flight tasks run to completion.
    pub async fn drain_node(&self, identity: &Identity, node_id: &NodeId) -> MeshResult<NodeView> {
        identity.require_admin()?;
        let view = self.store.set_node_drain(node_id, true).await?;
        info!(node = %node_id, "node draining");
        self.bus.emit(Event::node(
            EventKind::NodeDrain,
            self.clock.now(),
            node_id.clone(),
        ));
        Ok(view)
    }

    /// Resume handing work to a drained node.
    pub async fn undrain_node(
        &self,
        identity: &Identity,
        node_id: &NodeId,
    ) -> MeshResult<NodeView> {
        identity.require_admin()?;
        let view = self.store.set_node_drain(node_id, false).await?;
        info!(node = %node_id, "node undrained");
        self.bus.emit(Event::node(
            EventKind::NodeUndrain,
            self.clock.now(),
            node_id.clone(),
        ));
        Ok(view)
    }

    /// Revoke a node's trust. Soft: the node record stays, its tokens are
    /// dropped, and it can no longer claim or heartbeat. Revoking an
    /// already revoked node does not re-emit the event.
    pub async fn revoke_node(&self, identity: &Identity, node_id: &NodeId) -> MeshResult<NodeView> {
        identity.require_admin()?;
        let already_revoked = self
            .store
            .get_node(node_id)
            .await?
            .is_some_and(|view| view.node.revoked);

        let view = self
            .store
            .set_node_trust(node_id, None, Some(true))
            .await?;
        self.tokens.revoke_node_tokens(node_id);

        if !already_revoked {
            info!(node = %node_id, "node revoked");
            self.bus.emit(Event::node(
                EventKind::NodeRevoked,
                self.clock.now(),
                node_id.clone(),
            ));
        }
        Ok(view)
    }

    /// Cancel a task.
    pub async fn cancel_task(&self, identity: &Identity, task_id: &TaskId) -> MeshResult<Task> {
        self.lifecycle.cancel(identity, task_id).await
    }

    /// Replay a dead-lettered task.
    pub async fn replay_dlq(&self, identity: &Identity, task_id: &TaskId) -> MeshResult<Task> {
        self.lifecycle.replay_dlq(identity, task_id).await
    }

    /// Issue a producer job token bound to a task id.
    pub fn issue_job_token(&self, identity: &Identity, task_id: TaskId) -> MeshResult<String> {
        identity.require_admin()?;
        Ok(self.tokens.issue_job_token(task_id))
    }
}

impl std::fmt::Debug for Admin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admin").finish_non_exhaustive()
    }
}
