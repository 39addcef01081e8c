//! Aggregate run snapshots.
//!
//! Claim latency is measured from the event ring: a `task.enqueued` and a
//! `task.claimed` for the same task id form one sample. Only the first
//! claim of a task contributes, so retries do not skew the distribution.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::error::MeshResult;
use crate::events::{Event, EventBus, EventKind};
use crate::node::NodeId;
use crate::store::Store;
use crate::task::{TaskId, SCHEMA_VERSION};

/// Per-run claim-latency distribution.
#[derive(Clone, Debug, Serialize)]
pub struct ClaimLatencySummary {
    pub count: usize,
    pub avg_ms: i64,
    pub p50_ms: i64,
    pub p95_ms: i64,
    pub max_ms: i64,
}

/// Snapshot over the store and the event ring.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub schema_version: String,
    pub at: DateTime<Utc>,
    /// Task counts by status.
    pub tasks: BTreeMap<String, usize>,
    pub queue_depth: usize,
    pub dlq_depth: usize,
    /// Node counts by freshness state.
    pub nodes: BTreeMap<String, usize>,
    pub claim_latency: Option<ClaimLatencySummary>,
    pub counters: BTreeMap<String, u64>,
}

/// Pair enqueued/claimed events by task id and summarize the latencies.
pub fn claim_latency(events: &[Event]) -> Option<ClaimLatencySummary> {
    let mut enqueued: HashMap<&TaskId, DateTime<Utc>> = HashMap::new();
    let mut claimed: HashSet<&TaskId> = HashSet::new();
    let mut latencies: Vec<i64> = Vec::new();

    for event in events {
        let Some(task_id) = &event.task_id else {
            continue;
        };
        match event.kind {
            EventKind::TaskEnqueued => {
                enqueued.entry(task_id).or_insert(event.at);
            }
            EventKind::TaskClaimed => {
                if claimed.insert(task_id) {
                    if let Some(at) = enqueued.get(task_id) {
                        latencies.push((event.at - *at).num_milliseconds().max(0));
                    }
                }
            }
            _ => {}
        }
    }

    if latencies.is_empty() {
        return None;
    }
    latencies.sort_unstable();

    let count = latencies.len();
    let sum: i64 = latencies.iter().sum();
    Some(ClaimLatencySummary {
        count,
        avg_ms: sum / count as i64,
        p50_ms: percentile(&latencies, 50),
        p95_ms: percentile(&latencies, 95),
        max_ms: latencies[count - 1],
    })
}

fn percentile(sorted: &[i64], pct: usize) -> i64 {
    let rank = (pct * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// One node-scoped entry on the health timeline.
#[derive(Clone, Debug, Serialize)]
pub struct TimelinePoint {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: serde_json::Value,
}

/// Per-node health timeline from the event ring: heartbeats plus the
/// registration/trust/drain markers, in emission order.
pub fn node_timeline(events: &[Event]) -> BTreeMap<NodeId, Vec<TimelinePoint>> {
    let mut timeline: BTreeMap<NodeId, Vec<TimelinePoint>> = BTreeMap::new();
    for event in events {
        let Some(node_id) = &event.node_id else {
            continue;
        };
        match event.kind {
            EventKind::NodeRegistered
            | EventKind::NodeHeartbeat
            | EventKind::NodeRevoked
            | EventKind::NodeDrain
            | EventKind::NodeUndrain => {
                timeline
                    .entry(node_id.clone())
                    .or_default()
                    .push(TimelinePoint {
                        at: event.at,
                        kind: event.kind.as_str().to_string(),
                        detail: event.detail.clone(),
                    });
            }
            _ => {}
        }
    }
    timeline
}

/// Build a [`RunSummary`] from the store and the bus.
pub async fn run_summary(
    store: &dyn Store,
    bus: &EventBus,
    clock: &dyn Clock,
) -> MeshResult<RunSummary> {
    let tasks = store.list_tasks().await?;
    let nodes = store.list_nodes().await?;
    let dlq = store.list_dlq().await?;

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for task in &tasks {
        *by_status.entry(task.status.as_str().to_string()).or_insert(0) += 1;
    }
    let queue_depth = by_status.get("queued").copied().unwrap_or(0);

    let mut by_freshness: BTreeMap<String, usize> = BTreeMap::new();
    for node in &nodes {
        *by_freshness
            .entry(node.freshness.as_str().to_string())
            .or_insert(0) += 1;
    }

    Ok(RunSummary {
        schema_version: SCHEMA_VERSION.to_string(),
        at: clock.now(),
        tasks: by_status,
        queue_depth,
        dlq_depth: dlq.len(),
        nodes: by_freshness,
        claim_latency: claim_latency(&bus.recent()),
        counters: bus.counters(),
    })
}
