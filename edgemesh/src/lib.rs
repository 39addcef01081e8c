//! EdgeMesh - a control plane for pull-based worker fleets.
//!
//! Producers submit tasks; workers register, heartbeat, claim tasks they
//! are eligible for, acknowledge them, and post results. The control
//! plane owns all authoritative state: the task queue, per-node liveness,
//! claim leases, retry/backoff decisions, a dead-letter queue, and an
//! audit-style event stream.
//!
//! # Core Concepts
//!
//! - **Task**: the unit of work, moving through
//!   `queued → claimed → running → done|failed|cancelled` (see [`Task`]
//!   and [`TaskStatus`]).
//!
//! - **Store**: the single authoritative state holder behind the
//!   [`Store`] trait. The in-memory [`MemoryStore`] is the default; a
//!   durable PostgreSQL backend is available behind the `postgres`
//!   feature.
//!
//! - **Claim engine**: `Store::claim_task` recovers stale leases, gates
//!   on node health and capacity, filters by eligibility, and hands out
//!   the highest-priority / oldest eligible task — atomically.
//!
//! - **Lifecycle**: [`Lifecycle`] composes store transitions with the
//!   retry policy and emits an [`Event`] for every state change.
//!
//! - **Reaper**: [`TimeoutReaper`] enforces per-attempt timeouts and
//!   routes timed-out attempts through the same retry/DLQ decision as
//!   worker-reported failures.
//!
//! - **Events**: [`EventBus`] fans every event out to a bounded ring
//!   buffer, named counters, and live subscribers.
//!
//! # Quick Start
//!
//! ```ignore
//! use edgemesh::{Identity, MeshConfig, MeshRuntime, TaskSpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = MeshRuntime::new(MeshConfig::default())?;
//!     runtime.start().await;
//!
//!     // Producers submit through the lifecycle coordinator:
//!     // runtime.lifecycle().submit_task(&identity, spec).await?;
//!
//!     runtime.shutdown().await
//! }
//! ```
//!
//! # Delivery contract
//!
//! At-least-once with bounded retries, then the dead-letter queue.
//! `claim_task` is linearizable within a process: two concurrent claims
//! never return the same task unless a lease expired in between.

/// Admin surface: drain/undrain/revoke, cancel, DLQ replay, token
/// issuance.
pub mod admin;

/// Caller identity and token issuance.
pub mod auth;

/// Claim selection rules shared by the store backends.
pub mod claim;

/// Wall-clock and identifier minting, injectable for tests.
pub mod clock;

/// Configuration structures with defaults for every knob.
pub mod config;

/// The stable error taxonomy surfaced to callers.
pub mod error;

/// Lifecycle events and the in-process event bus.
pub mod events;

/// The task lifecycle coordinator.
pub mod lifecycle;

/// Prometheus instrumentation.
pub mod metrics;

/// Node model, heartbeats, and the freshness evaluator.
pub mod node;

/// The timeout reaper.
pub mod reaper;

/// The retry/backoff decision.
pub mod retry;

/// Runtime wiring and graceful shutdown.
pub mod runtime;

/// The authoritative state abstraction and its backends.
pub mod store;

/// Aggregate run snapshots and claim-latency summaries.
pub mod summary;

/// Task model, results, and dead-letter entries.
pub mod task;

/// Tracing span helpers.
pub mod telemetry;

pub use admin::Admin;
pub use auth::{Identity, TokenService};
pub use clock::{Clock, IdMinter, SystemClock, UuidMinter};
pub use config::{AuthConfig, MeshConfig, StoreBackend};
pub use error::{MeshError, MeshResult};
pub use events::{Event, EventBus, EventKind};
pub use lifecycle::Lifecycle;
pub use metrics::MeshMetrics;
pub use node::{
    evaluate_freshness, FreshnessState, FreshnessThresholds, Heartbeat, HeartbeatStatus, Node,
    NodeCapabilities, NodeId, NodeView,
};
pub use reaper::{ReapSummary, TimeoutReaper};
pub use retry::{compute_retry_decision, RetryConfig, RetryDecision};
pub use runtime::{MeshRuntime, MeshRuntimeBuilder, ShutdownToken};
pub use store::MemoryStore;
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use store::Store;
pub use summary::{
    claim_latency, node_timeline, run_summary, ClaimLatencySummary, RunSummary, TimelinePoint,
};
pub use task::{
    DlqEntry, DlqReason, Task, TaskId, TaskResult, TaskSpec, TaskStatus, SCHEMA_VERSION,
};
