//! Wiring for a running control plane.
//!
//! [`MeshRuntime`] constructs the shared pieces once — clock, id minter,
//! store, event bus, metrics, token service, lifecycle coordinator,
//! admin surface — and owns the background tasks (timeout reaper,
//! metrics observer).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{info, warn};

use crate::admin::Admin;
use crate::auth::{Identity, TokenService};
use crate::clock::{Clock, IdMinter, SystemClock, UuidMinter};
use crate::config::{MeshConfig, StoreBackend};
use crate::error::MeshResult;
use crate::events::{Event, EventBus};
use crate::lifecycle::Lifecycle;
use crate::metrics::MeshMetrics;
use crate::node::{NodeCapabilities, NodeId, NodeView};
use crate::reaper::TimeoutReaper;
use crate::store::{MemoryStore, Store};
use crate::summary::{node_timeline, run_summary, RunSummary, TimelinePoint};
use crate::task::{Task, TaskStatus};

/// Token for signaling graceful shutdown to background tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired control plane.
pub struct MeshRuntime {
    config: MeshConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    metrics: Arc<MeshMetrics>,
    tokens: Arc<TokenService>,
    lifecycle: Arc<Lifecycle>,
    admin: Arc<Admin>,
    reaper: Arc<TimeoutReaper>,
    shutdown: ShutdownToken,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MeshRuntime {
    /// Build a runtime with default components from the config.
    pub fn new(config: MeshConfig) -> anyhow::Result<Self> {
        MeshRuntimeBuilder::new(config).build()
    }

    pub fn builder(config: MeshConfig) -> MeshRuntimeBuilder {
        MeshRuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn metrics(&self) -> Arc<MeshMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn tokens(&self) -> Arc<TokenService> {
        Arc::clone(&self.tokens)
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    pub fn admin(&self) -> Arc<Admin> {
        Arc::clone(&self.admin)
    }

    pub fn reaper(&self) -> Arc<TimeoutReaper> {
        Arc::clone(&self.reaper)
    }

    /// Subscribe to the live event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Start the background tasks: the timeout reaper and the metrics
    /// observer.
    pub async fn start(&self) {
        let reaper_handle = self
            .reaper
            .spawn(self.config.reaper_interval_ms, self.shutdown.clone());

        let metrics = Arc::clone(&self.metrics);
        let mut events = self.bus.subscribe();
        let shutdown = self.shutdown.clone();
        let observer_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("metrics observer shutting down");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => metrics.observe_event(&event),
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("metrics observer lagged, skipped {skipped} events");
                        }
                    }
                }
            }
        });

        let mut background = self.background.lock().await;
        background.push(reaper_handle);
        background.push(observer_handle);
    }

    /// Gracefully stop the background tasks.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("shutting down mesh runtime");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.background.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(tokio::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("background task failed: {err:?}"),
                Err(_) => warn!("background task timed out during shutdown"),
            }
        }
        info!("mesh runtime shutdown complete");
        Ok(())
    }

    /// Register a node: verify the bootstrap secret, upsert the node, and
    /// issue its identity token.
    pub async fn register_node(
        &self,
        bootstrap_secret: &str,
        node_id: NodeId,
        capabilities: NodeCapabilities,
    ) -> MeshResult<(NodeView, String)> {
        let identity = self.tokens.verify_bootstrap(bootstrap_secret)?;
        self.metrics.record_request("node.register");
        let view = self
            .lifecycle
            .register_node(&identity, node_id.clone(), capabilities)
            .await?;
        let token = self.tokens.issue_node_token(node_id);
        Ok((view, token))
    }

    /// Rotate a node's identity token.
    pub fn refresh_node_token(&self, token: &str) -> MeshResult<(NodeId, String)> {
        self.metrics.record_request("node.refresh_token");
        self.tokens.rotate_node_token(token)
    }

    /// Verify an admin secret into an identity for the admin surface.
    pub fn admin_identity(&self, secret: &str) -> MeshResult<Identity> {
        self.tokens.verify_admin(secret)
    }

    pub async fn tasks(&self) -> MeshResult<Vec<Task>> {
        self.store.list_tasks().await
    }

    pub async fn queued_tasks(&self) -> MeshResult<Vec<Task>> {
        Ok(self
            .store
            .list_tasks()
            .await?
            .into_iter()
            .filter(|task| task.status == TaskStatus::Queued)
            .collect())
    }

    pub async fn running_tasks(&self) -> MeshResult<Vec<Task>> {
        Ok(self
            .store
            .list_tasks()
            .await?
            .into_iter()
            .filter(|task| task.status.is_in_flight())
            .collect())
    }

    pub async fn nodes(&self) -> MeshResult<Vec<NodeView>> {
        self.store.list_nodes().await
    }

    /// Aggregate snapshot for the `runs.summary` surface.
    pub async fn summary(&self) -> MeshResult<RunSummary> {
        run_summary(self.store.as_ref(), &self.bus, self.clock.as_ref()).await
    }

    /// Per-node health timeline for the `node.stats` surface.
    pub fn node_timeline(&self) -> std::collections::BTreeMap<NodeId, Vec<TimelinePoint>> {
        node_timeline(&self.bus.recent())
    }

    /// Prometheus text exposition, with gauges refreshed from the store.
    pub async fn metrics_text(&self) -> MeshResult<String> {
        let tasks = self.store.list_tasks().await?;
        let nodes = self.store.list_nodes().await?;
        let dlq = self.store.list_dlq().await?;
        self.metrics.refresh(&tasks, &nodes, dlq.len());
        self.metrics.render().map_err(Into::into)
    }
}

impl std::fmt::Debug for MeshRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshRuntime")
            .field("config", &self.config)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Builder allowing tests to inject a clock, id minter, or store.
pub struct MeshRuntimeBuilder {
    config: MeshConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdMinter>>,
    store: Option<Arc<dyn Store>>,
}

impl MeshRuntimeBuilder {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            clock: None,
            ids: None,
            store: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdMinter>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> anyhow::Result<MeshRuntime> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self.ids.unwrap_or_else(|| Arc::new(UuidMinter));

        let store: Arc<dyn Store> = match (self.store, &config.store) {
            (Some(store), _) => store,
            (None, StoreBackend::Memory) => Arc::new(MemoryStore::new(
                Arc::clone(&clock),
                config.freshness,
                config.claim_ttl_ms,
            )),
            (None, StoreBackend::Postgres { .. }) => {
                // Pool construction is async and owned by the bootstrap
                // layer; it builds the PostgresStore and injects it here.
                anyhow::bail!("postgres backend requires an injected store")
            }
        };

        let bus = Arc::new(EventBus::new(
            config.event_ring_capacity,
            config.event_channel_capacity,
        ));
        let metrics = Arc::new(MeshMetrics::new());
        let tokens = Arc::new(TokenService::new(Arc::clone(&clock), config.auth.clone()));
        let lifecycle = Arc::new(Lifecycle::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&clock),
            ids,
            config.retry.clone(),
        ));
        let admin = Arc::new(Admin::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&clock),
            Arc::clone(&lifecycle),
            Arc::clone(&tokens),
        ));
        let reaper = Arc::new(TimeoutReaper::new(
            Arc::clone(&store),
            Arc::clone(&lifecycle),
            Arc::clone(&clock),
        ));

        Ok(MeshRuntime {
            config,
            clock,
            store,
            bus,
            metrics,
            tokens,
            lifecycle,
            admin,
            reaper,
            shutdown: ShutdownToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }
}

impl std::fmt::Debug for MeshRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshRuntimeBuilder")
            .field("config", &self.config)
            .field("clock_set", &self.clock.is_some())
            .field("ids_set", &self.ids.is_some())
            .field("store_set", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .expect("cancelled() returns immediately");
    }

    #[tokio::test]
    async fn shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("waiter observed cancellation")
            .expect("waiter did not panic");
    }

    #[tokio::test]
    async fn default_runtime_starts_and_shuts_down() {
        let runtime = MeshRuntime::new(MeshConfig::default()).expect("build");
        runtime.start().await;
        timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("shutdown completes")
            .expect("shutdown ok");
    }

    #[test]
    fn postgres_backend_without_store_is_an_error() {
        let config = MeshConfig {
            store: StoreBackend::Postgres {
                url: "postgres://mesh@localhost/mesh".to_string(),
            },
            ..MeshConfig::default()
        };
        assert!(MeshRuntime::new(config).is_err());
    }
}
