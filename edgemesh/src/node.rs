use std::collections::BTreeSet;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for a worker node.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What a node offers to the scheduler: routing tags and a concurrency cap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Routing tags; a task's `required_tags` must all be present here.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Maximum tasks the node may hold in claimed/running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,
}

fn default_max_concurrent() -> u32 {
    1
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            tags: BTreeSet::new(),
            max_concurrent_tasks: default_max_concurrent(),
        }
    }
}

/// Health status reported by the node itself in a heartbeat.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Healthy,
    Degraded,
}

/// Most recent liveness report from a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub ts: DateTime<Utc>,
    pub status: HeartbeatStatus,
    /// Load factor in `[0, 1]` as reported by the node.
    pub load: f64,
    pub running_tasks: u32,
}

/// Liveness classification derived from heartbeat age and reported status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessState {
    Healthy,
    Degraded,
    Offline,
}

impl FreshnessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        }
    }
}

impl Display for FreshnessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Heartbeat-age cutoffs for the freshness evaluation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FreshnessThresholds {
    /// Heartbeats older than this are at best degraded.
    #[serde(default = "default_healthy_ms")]
    pub healthy_ms: u64,
    /// Heartbeats older than this mean the node is offline.
    #[serde(default = "default_degraded_ms")]
    pub degraded_ms: u64,
}

fn default_healthy_ms() -> u64 {
    10_000
}

fn default_degraded_ms() -> u64 {
    30_000
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            healthy_ms: default_healthy_ms(),
            degraded_ms: default_degraded_ms(),
        }
    }
}

/// Classify a node's liveness from its last heartbeat.
///
/// Pure function of `(heartbeat, now, thresholds)`; a node that has never
/// heartbeated is offline.
pub fn evaluate_freshness(
    last_heartbeat: Option<&Heartbeat>,
    now: DateTime<Utc>,
    thresholds: &FreshnessThresholds,
) -> FreshnessState {
    let Some(hb) = last_heartbeat else {
        return FreshnessState::Offline;
    };
    let age_ms = (now - hb.ts).num_milliseconds();
    if age_ms > thresholds.degraded_ms as i64 {
        FreshnessState::Offline
    } else if age_ms > thresholds.healthy_ms as i64 {
        FreshnessState::Degraded
    } else if hb.status == HeartbeatStatus::Degraded {
        FreshnessState::Degraded
    } else {
        FreshnessState::Healthy
    }
}

/// A registered worker node.
///
/// Nodes are created by registration, updated by heartbeats and admin
/// operations, and never deleted; revocation is a soft flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub capabilities: NodeCapabilities,
    pub trusted: bool,
    pub revoked: bool,
    #[serde(default)]
    pub draining: bool,
    pub last_heartbeat: Option<Heartbeat>,
}

impl Node {
    /// A freshly registered node: trusted, not revoked, not draining.
    pub fn new(node_id: NodeId, capabilities: NodeCapabilities) -> Self {
        Self {
            node_id,
            capabilities,
            trusted: true,
            revoked: false,
            draining: false,
            last_heartbeat: None,
        }
    }
}

/// Node plus its derived freshness, as returned by store reads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub freshness: FreshnessState,
}

impl NodeView {
    pub fn of(node: Node, now: DateTime<Utc>, thresholds: &FreshnessThresholds) -> Self {
        let freshness = evaluate_freshness(node.last_heartbeat.as_ref(), now, thresholds);
        Self { node, freshness }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn hb(ts: DateTime<Utc>, status: HeartbeatStatus) -> Heartbeat {
        Heartbeat {
            ts,
            status,
            load: 0.2,
            running_tasks: 0,
        }
    }

    #[test]
    fn no_heartbeat_is_offline() {
        let now = Utc::now();
        let state = evaluate_freshness(None, now, &FreshnessThresholds::default());
        assert_eq!(state, FreshnessState::Offline);
    }

    #[test]
    fn fresh_heartbeat_is_healthy() {
        let now = Utc::now();
        let beat = hb(now - Duration::milliseconds(500), HeartbeatStatus::Healthy);
        let state = evaluate_freshness(Some(&beat), now, &FreshnessThresholds::default());
        assert_eq!(state, FreshnessState::Healthy);
    }

    #[test]
    fn reported_degraded_wins_over_fresh_age() {
        let now = Utc::now();
        let beat = hb(now, HeartbeatStatus::Degraded);
        let state = evaluate_freshness(Some(&beat), now, &FreshnessThresholds::default());
        assert_eq!(state, FreshnessState::Degraded);
    }

    #[test]
    fn stale_heartbeat_degrades_then_goes_offline() {
        let thresholds = FreshnessThresholds {
            healthy_ms: 60,
            degraded_ms: 180,
        };
        let now = Utc::now();

        let beat = hb(now - Duration::milliseconds(80), HeartbeatStatus::Healthy);
        assert_eq!(
            evaluate_freshness(Some(&beat), now, &thresholds),
            FreshnessState::Degraded
        );

        let beat = hb(now - Duration::milliseconds(200), HeartbeatStatus::Healthy);
        assert_eq!(
            evaluate_freshness(Some(&beat), now, &thresholds),
            FreshnessState::Offline
        );
    }

    #[test]
    fn threshold_boundaries_are_exclusive() {
        let thresholds = FreshnessThresholds {
            healthy_ms: 100,
            degraded_ms: 300,
        };
        let now = Utc::now();

        // Exactly at the healthy cutoff is still healthy.
        let beat = hb(now - Duration::milliseconds(100), HeartbeatStatus::Healthy);
        assert_eq!(
            evaluate_freshness(Some(&beat), now, &thresholds),
            FreshnessState::Healthy
        );

        // Exactly at the degraded cutoff is still degraded.
        let beat = hb(now - Duration::milliseconds(300), HeartbeatStatus::Healthy);
        assert_eq!(
            evaluate_freshness(Some(&beat), now, &thresholds),
            FreshnessState::Degraded
        );
    }
}
