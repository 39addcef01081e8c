//! Periodic sweeper for per-attempt timeouts.
//!
//! Tasks declare an optional `timeout_ms`; the reaper is the only place
//! that enforces it. A claimed or running task whose claim age exceeds
//! its timeout either goes back to the queue (with backoff) or fails
//! with a synthesized `task_timeout` result and a dead-letter entry.
//! Tasks without a timeout, and terminal tasks, are untouched.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::MeshResult;
use crate::lifecycle::Lifecycle;
use crate::runtime::ShutdownToken;
use crate::store::Store;
use crate::task::TaskResult;

/// Counts from one reaper pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReapSummary {
    pub requeued: u64,
    pub dead_lettered: u64,
}

/// The timeout reaper. Ticks are driven externally in tests and by
/// [`TimeoutReaper::spawn`] in production.
pub struct TimeoutReaper {
    store: Arc<dyn Store>,
    lifecycle: Arc<Lifecycle>,
    clock: Arc<dyn Clock>,
}

impl TimeoutReaper {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<Lifecycle>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            lifecycle,
            clock,
        }
    }

    /// Sweep once. Timed-out attempts follow the same failure path as a
    /// worker-reported error, with a synthesized result.
    pub async fn tick(&self) -> MeshResult<ReapSummary> {
        let now = self.clock.now();
        let mut summary = ReapSummary::default();

        for task in self.store.list_tasks().await? {
            if !task.status.is_in_flight() {
                continue;
            }
            let Some(timeout_ms) = task.timeout_ms else {
                continue;
            };
            let Some(claimed_at) = task.claimed_at else {
                continue;
            };
            if (now - claimed_at).num_milliseconds() <= timeout_ms as i64 {
                continue;
            }
            let Some(node_id) = task.assigned_node_id.clone() else {
                continue;
            };

            let result = TaskResult {
                task_id: task.task_id.clone(),
                node_id,
                ok: false,
                output: None,
                error: Some("task_timeout".to_string()),
                finished_at: now,
            };
            let retried = self
                .lifecycle
                .fail_attempt(task, Some(result), "timeout")
                .await?;
            if retried {
                summary.requeued += 1;
            } else {
                summary.dead_lettered += 1;
            }
        }

        Ok(summary)
    }

    /// Run `tick` on a fixed period until shutdown. A failing tick is
    /// logged and the loop continues on the next period.
    pub fn spawn(
        self: &Arc<Self>,
        interval_ms: u64,
        shutdown: ShutdownToken,
    ) -> tokio::task::JoinHandle<()> {
        let reaper = Arc::clone(self);
        let interval = tokio::time::Duration::from_millis(interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("timeout reaper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match reaper.tick().await {
                            Ok(summary) if summary.requeued > 0 || summary.dead_lettered > 0 => {
                                info!(
                                    requeued = summary.requeued,
                                    dead_lettered = summary.dead_lettered,
                                    "reaped timed-out tasks"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => warn!("timeout reaper tick error: {err}"),
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for TimeoutReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutReaper").finish_non_exhaustive()
    }
}
