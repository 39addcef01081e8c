//! Claim selection rules shared by every store backend.
//!
//! The predicates here are pure so the selection semantics stay identical
//! whether the backend evaluates them under a process-local mutex or
//! re-checks them on a row it has locked.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::node::{Node, NodeView};
use crate::task::{Task, TaskStatus};

/// Whether a claimed task's lease has lapsed and it should be recovered.
///
/// Only `claimed` tasks are recovered here; a `running` task is the
/// reaper's business via its per-attempt timeout.
pub fn claim_expired(task: &Task, now: DateTime<Utc>, claim_ttl_ms: u64) -> bool {
    task.status == TaskStatus::Claimed
        && task
            .claimed_at
            .is_some_and(|at| (now - at).num_milliseconds() >= claim_ttl_ms as i64)
}

/// Whether a queued task may be handed to the given node right now.
pub fn is_eligible(task: &Task, node: &Node, now: DateTime<Utc>) -> bool {
    task.status == TaskStatus::Queued
        && task.retry_after.is_none_or(|after| after <= now)
        && task
            .target_node_id
            .as_ref()
            .is_none_or(|target| target == &node.node_id)
        && task
            .required_tags
            .iter()
            .all(|tag| node.capabilities.tags.contains(tag))
}

/// Selection order among eligible tasks: priority descending, then
/// enqueue time ascending, then task id ascending as the deterministic
/// tiebreak.
pub fn candidate_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.task_id.cmp(&b.task_id))
}

/// Whether a node may claim work at all: trusted, not revoked, not
/// draining, and currently healthy.
pub fn node_claimable(view: &NodeView) -> bool {
    view.node.trusted
        && !view.node.revoked
        && !view.node.draining
        && view.freshness == crate::node::FreshnessState::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FreshnessState, NodeCapabilities, NodeId};
    use crate::task::{TaskId, TaskSpec};
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn node_with_tags(tags: &[&str]) -> Node {
        let mut caps = NodeCapabilities::default();
        caps.tags = tags.iter().map(|t| t.to_string()).collect();
        Node::new(NodeId::from("n1"), caps)
    }

    fn queued(id: &str, priority: i32, created_at: DateTime<Utc>) -> Task {
        let spec = TaskSpec {
            task_id: None,
            kind: "job".to_string(),
            payload: serde_json::Value::Null,
            target_node_id: None,
            required_tags: BTreeSet::new(),
            priority,
            max_attempts: None,
            timeout_ms: None,
        };
        Task::from_spec(spec, TaskId::from(id), created_at)
    }

    #[test]
    fn higher_priority_sorts_first() {
        let now = Utc::now();
        let low = queued("low", 1, now);
        let high = queued("high", 10, now);
        assert_eq!(candidate_order(&high, &low), Ordering::Less);
    }

    #[test]
    fn equal_priority_falls_back_to_fifo() {
        let now = Utc::now();
        let first = queued("a", 5, now);
        let second = queued("b", 5, now + Duration::milliseconds(1));
        assert_eq!(candidate_order(&first, &second), Ordering::Less);
    }

    #[test]
    fn full_tie_breaks_on_task_id() {
        let now = Utc::now();
        let a = queued("aaa", 5, now);
        let b = queued("bbb", 5, now);
        assert_eq!(candidate_order(&a, &b), Ordering::Less);
        assert_eq!(candidate_order(&b, &a), Ordering::Greater);
    }

    #[test]
    fn required_tags_must_all_be_present() {
        let now = Utc::now();
        let node = node_with_tags(&["linux"]);

        let mut gpu = queued("gpu", 99, now);
        gpu.required_tags = ["gpu".to_string()].into_iter().collect();
        assert!(!is_eligible(&gpu, &node, now));

        let mut linux = queued("linux", 1, now);
        linux.required_tags = ["linux".to_string()].into_iter().collect();
        assert!(is_eligible(&linux, &node, now));
    }

    #[test]
    fn target_node_excludes_others() {
        let now = Utc::now();
        let node = node_with_tags(&[]);
        let mut task = queued("t", 0, now);
        task.target_node_id = Some(NodeId::from("other"));
        assert!(!is_eligible(&task, &node, now));

        task.target_node_id = Some(NodeId::from("n1"));
        assert!(is_eligible(&task, &node, now));
    }

    #[test]
    fn retry_after_gates_eligibility() {
        let now = Utc::now();
        let node = node_with_tags(&[]);
        let mut task = queued("t", 0, now);

        task.retry_after = Some(now + Duration::milliseconds(100));
        assert!(!is_eligible(&task, &node, now));

        task.retry_after = Some(now);
        assert!(is_eligible(&task, &node, now));
    }

    #[test]
    fn claim_expiry_requires_claimed_status() {
        let now = Utc::now();
        let mut task = queued("t", 0, now - Duration::seconds(60));
        task.status = TaskStatus::Claimed;
        task.claimed_at = Some(now - Duration::seconds(45));
        assert!(claim_expired(&task, now, 30_000));

        task.status = TaskStatus::Running;
        assert!(!claim_expired(&task, now, 30_000));

        task.status = TaskStatus::Claimed;
        task.claimed_at = Some(now - Duration::seconds(10));
        assert!(!claim_expired(&task, now, 30_000));
    }

    #[test]
    fn unhealthy_or_flagged_nodes_cannot_claim() {
        let now = Utc::now();
        let thresholds = crate::node::FreshnessThresholds::default();
        let mut node = node_with_tags(&[]);
        node.last_heartbeat = Some(crate::node::Heartbeat {
            ts: now,
            status: crate::node::HeartbeatStatus::Healthy,
            load: 0.0,
            running_tasks: 0,
        });

        let view = NodeView::of(node.clone(), now, &thresholds);
        assert_eq!(view.freshness, FreshnessState::Healthy);
        assert!(node_claimable(&view));

        let mut draining = node.clone();
        draining.draining = true;
        assert!(!node_claimable(&NodeView::of(draining, now, &thresholds)));

        let mut revoked = node.clone();
        revoked.revoked = true;
        assert!(!node_claimable(&NodeView::of(revoked, now, &thresholds)));

        let mut untrusted = node.clone();
        untrusted.trusted = false;
        assert!(!node_claimable(&NodeView::of(untrusted, now, &thresholds)));

        let mut silent = node;
        silent.last_heartbeat = None;
        assert!(!node_claimable(&NodeView::of(silent, now, &thresholds)));
    }
}
