use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use edgemesh::{
    Heartbeat, HeartbeatStatus, Node, NodeCapabilities, NodeId, TaskId, TaskSpec,
};

/// Start building a node fixture.
pub fn node(id: &str) -> NodeBuilder {
    NodeBuilder {
        node_id: NodeId::from(id),
        tags: BTreeSet::new(),
        max_concurrent_tasks: 4,
        heartbeat_at: None,
        heartbeat_status: HeartbeatStatus::Healthy,
    }
}

pub struct NodeBuilder {
    node_id: NodeId,
    tags: BTreeSet<String>,
    max_concurrent_tasks: u32,
    heartbeat_at: Option<DateTime<Utc>>,
    heartbeat_status: HeartbeatStatus,
}

impl NodeBuilder {
    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn max_concurrent(mut self, limit: u32) -> Self {
        self.max_concurrent_tasks = limit;
        self
    }

    /// Give the node a heartbeat at the given instant.
    pub fn beating_at(mut self, at: DateTime<Utc>) -> Self {
        self.heartbeat_at = Some(at);
        self
    }

    pub fn reporting(mut self, status: HeartbeatStatus) -> Self {
        self.heartbeat_status = status;
        self
    }

    pub fn build(self) -> Node {
        let mut built = Node::new(
            self.node_id,
            NodeCapabilities {
                tags: self.tags,
                max_concurrent_tasks: self.max_concurrent_tasks,
            },
        );
        if let Some(ts) = self.heartbeat_at {
            built.last_heartbeat = Some(Heartbeat {
                ts,
                status: self.heartbeat_status,
                load: 0.1,
                running_tasks: 0,
            });
        }
        built
    }

    /// The heartbeat alone, for feeding `Lifecycle::heartbeat`.
    pub fn heartbeat(at: DateTime<Utc>) -> Heartbeat {
        Heartbeat {
            ts: at,
            status: HeartbeatStatus::Healthy,
            load: 0.1,
            running_tasks: 0,
        }
    }
}

/// Start building a task spec fixture.
pub fn task(kind: &str) -> TaskBuilder {
    TaskBuilder {
        spec: TaskSpec {
            task_id: None,
            kind: kind.to_string(),
            payload: serde_json::Value::Null,
            target_node_id: None,
            required_tags: BTreeSet::new(),
            priority: 0,
            max_attempts: None,
            timeout_ms: None,
        },
    }
}

pub struct TaskBuilder {
    spec: TaskSpec,
}

impl TaskBuilder {
    pub fn id(mut self, id: &str) -> Self {
        self.spec.task_id = Some(TaskId::from(id));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn require_tag(mut self, tag: &str) -> Self {
        self.spec.required_tags.insert(tag.to_string());
        self
    }

    pub fn target(mut self, node_id: &str) -> Self {
        self.spec.target_node_id = Some(NodeId::from(node_id));
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.spec.max_attempts = Some(attempts);
        self
    }

    pub fn timeout_ms(mut self, timeout: u64) -> Self {
        self.spec.timeout_ms = Some(timeout);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.spec.payload = payload;
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_builder_sets_tags_and_heartbeat() {
        let now = Utc::now();
        let built = node("n1").tag("linux").max_concurrent(2).beating_at(now).build();
        assert_eq!(built.node_id, NodeId::from("n1"));
        assert!(built.capabilities.tags.contains("linux"));
        assert_eq!(built.capabilities.max_concurrent_tasks, 2);
        assert_eq!(built.last_heartbeat.map(|hb| hb.ts), Some(now));
    }

    #[test]
    fn task_builder_sets_routing() {
        let spec = task("render")
            .id("t1")
            .priority(7)
            .require_tag("gpu")
            .target("n1")
            .max_attempts(1)
            .timeout_ms(100)
            .build();
        assert_eq!(spec.task_id, Some(TaskId::from("t1")));
        assert_eq!(spec.priority, 7);
        assert!(spec.required_tags.contains("gpu"));
        assert_eq!(spec.target_node_id, Some(NodeId::from("n1")));
        assert_eq!(spec.max_attempts, Some(1));
        assert_eq!(spec.timeout_ms, Some(100));
    }
}
