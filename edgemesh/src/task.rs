use std::collections::BTreeSet;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::NodeId;

/// Version carried by every persisted record and API payload.
/// Forward-compatible additions are allowed; breaking changes bump it.
pub const SCHEMA_VERSION: &str = "1.0";

/// Opaque identifier for a task.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Whether a node currently holds this task under a claim lease.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Producer-submitted description of a task.
///
/// The lifecycle coordinator mints the id and stamps `created_at` when the
/// spec does not carry an id of its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub target_node_id: Option<NodeId>,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
    /// Higher is more urgent; missing means 0.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Default retry budget when the producer does not set one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A unit of work owned by the control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub kind: String,
    pub payload: Value,
    pub target_node_id: Option<NodeId>,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub max_attempts: u32,
    #[serde(default)]
    pub attempt: u32,
    /// Earliest wall-time at which the task may be claimed again.
    /// Gates only the queued → claimed transition.
    pub retry_after: Option<DateTime<Utc>>,
    /// Per-attempt deadline enforced by the reaper.
    pub timeout_ms: Option<u64>,
    /// Set iff status is claimed or running.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set iff status is claimed or running.
    pub assigned_node_id: Option<NodeId>,
    pub status: TaskStatus,
    #[serde(default = "schema_version")]
    pub schema_version: String,
}

fn schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

impl Task {
    /// Materialize a queued task from a producer spec.
    pub fn from_spec(spec: TaskSpec, task_id: TaskId, created_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            kind: spec.kind,
            payload: spec.payload,
            target_node_id: spec.target_node_id,
            required_tags: spec.required_tags,
            priority: spec.priority,
            created_at,
            max_attempts: spec.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            attempt: 0,
            retry_after: None,
            timeout_ms: spec.timeout_ms,
            claimed_at: None,
            assigned_node_id: None,
            status: TaskStatus::Queued,
            schema_version: schema_version(),
        }
    }
}

/// Terminal outcome posted by the assigned node (or synthesized by the
/// reaper for timeouts). One result per terminal arrival; rewriting is
/// disallowed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub ok: bool,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Why a task landed in the dead-letter queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxAttemptsExhausted,
    Timeout,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxAttemptsExhausted => "max_attempts_exhausted",
            Self::Timeout => "timeout",
        }
    }
}

impl Display for DlqReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dead-letter holding record, retained for operator inspection and replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqEntry {
    pub task_id: TaskId,
    /// Snapshot of the task at the moment it was dead-lettered.
    pub task: Task,
    pub last_result: Option<TaskResult>,
    pub reason: DlqReason,
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: &str) -> TaskSpec {
        TaskSpec {
            task_id: None,
            kind: kind.to_string(),
            payload: Value::Null,
            target_node_id: None,
            required_tags: BTreeSet::new(),
            priority: 0,
            max_attempts: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn from_spec_defaults() {
        let now = Utc::now();
        let task = Task::from_spec(spec("render"), TaskId::from("t1"), now);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(task.attempt, 0);
        assert!(task.claimed_at.is_none());
        assert!(task.assigned_node_id.is_none());
        assert_eq!(task.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn max_attempts_floor_is_one() {
        let now = Utc::now();
        let mut s = spec("render");
        s.max_attempts = Some(0);
        let task = Task::from_spec(s, TaskId::from("t1"), now);
        assert_eq!(task.max_attempts, 1);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Claimed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn status_serde_round_trip() {
        let json = serde_json::to_string(&TaskStatus::Cancelled).expect("serialize");
        assert_eq!(json, "\"cancelled\"");
        let back: TaskStatus = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, TaskStatus::Cancelled);
    }
}
