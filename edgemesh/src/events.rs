use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::node::NodeId;
use crate::task::TaskId;

/// Kind of a lifecycle event flowing through the bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "node.registered")]
    NodeRegistered,
    #[serde(rename = "node.heartbeat")]
    NodeHeartbeat,
    #[serde(rename = "node.revoked")]
    NodeRevoked,
    #[serde(rename = "node.drain")]
    NodeDrain,
    #[serde(rename = "node.undrain")]
    NodeUndrain,
    #[serde(rename = "task.enqueued")]
    TaskEnqueued,
    #[serde(rename = "task.claimed")]
    TaskClaimed,
    #[serde(rename = "task.running")]
    TaskRunning,
    #[serde(rename = "task.done")]
    TaskDone,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeRegistered => "node.registered",
            Self::NodeHeartbeat => "node.heartbeat",
            Self::NodeRevoked => "node.revoked",
            Self::NodeDrain => "node.drain",
            Self::NodeUndrain => "node.undrain",
            Self::TaskEnqueued => "task.enqueued",
            Self::TaskClaimed => "task.claimed",
            Self::TaskRunning => "task.running",
            Self::TaskDone => "task.done",
            Self::TaskFailed => "task.failed",
            Self::TaskCancelled => "task.cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single audit-style lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl Event {
    pub fn task(kind: EventKind, at: DateTime<Utc>, task_id: TaskId) -> Self {
        Self {
            kind,
            at,
            node_id: None,
            task_id: Some(task_id),
            detail: Value::Null,
        }
    }

    pub fn node(kind: EventKind, at: DateTime<Utc>, node_id: NodeId) -> Self {
        Self {
            kind,
            at,
            node_id: Some(node_id),
            task_id: None,
            detail: Value::Null,
        }
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Single in-process fan-out point for every state change.
///
/// `emit` is synchronous and does bounded work: it appends to the ring
/// buffer, bumps a counter, and pushes the event onto a broadcast channel
/// for live subscribers. A slow subscriber lags and is cut loose by the
/// channel (`RecvError::Lagged`); it never blocks emission and is never
/// buffered without bound.
///
/// Events are delivered in emission order within the process. There is no
/// cross-process ordering guarantee.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    ring: Mutex<VecDeque<Event>>,
    counters: Mutex<BTreeMap<String, u64>>,
    ring_capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("ring_capacity", &self.ring_capacity)
            .field("ring_len", &self.ring.lock().len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with the given ring capacity and live-channel capacity.
    pub fn new(ring_capacity: usize, channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity.min(4096))),
            counters: Mutex::new(BTreeMap::new()),
            ring_capacity: ring_capacity.max(1),
        }
    }

    /// Emit an event to the ring, the counters, and every live subscriber.
    pub fn emit(&self, event: Event) {
        {
            let mut ring = self.ring.lock();
            if ring.len() == self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        self.bump(event.kind.as_str());
        // No receivers is fine; the send result is deliberately ignored.
        let _ = self.sender.send(event);
    }

    /// Increment a named counter. Used for event kinds and for bookkeeping
    /// counts such as ignored late arrivals.
    pub fn bump(&self, name: &str) {
        let mut counters = self.counters.lock();
        *counters.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Subscribe to the live event stream. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Snapshot of the ring buffer, oldest first.
    pub fn recent(&self) -> Vec<Event> {
        self.ring.lock().iter().cloned().collect()
    }

    /// Snapshot of all counters.
    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }
}
