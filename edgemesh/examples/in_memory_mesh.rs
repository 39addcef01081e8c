//! Minimal control plane on the in-memory store.
//!
//! Registers a node, submits a couple of tasks, and walks one of them
//! through claim → ack → result, printing the run summary at the end.
//!
//! Run with: `cargo run --example in_memory_mesh`

use std::collections::BTreeSet;

use edgemesh::{
    Heartbeat, HeartbeatStatus, Identity, MeshConfig, MeshRuntime, NodeCapabilities, NodeId,
    TaskResult, TaskSpec,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime = MeshRuntime::new(MeshConfig::default())?;
    runtime.start().await;
    let lifecycle = runtime.lifecycle();

    // A worker registers and heartbeats.
    let node_id = NodeId::from("worker-1");
    lifecycle
        .register_node(
            &Identity::Bootstrap,
            node_id.clone(),
            NodeCapabilities {
                tags: ["linux".to_string()].into_iter().collect(),
                max_concurrent_tasks: 2,
            },
        )
        .await?;
    lifecycle
        .heartbeat(
            &Identity::Node(node_id.clone()),
            &node_id,
            Heartbeat {
                ts: chrono::Utc::now(),
                status: HeartbeatStatus::Healthy,
                load: 0.2,
                running_tasks: 0,
            },
        )
        .await?;

    // A producer submits two tasks with different priorities.
    for (id, priority) in [("thumbnail", 1), ("transcode", 10)] {
        lifecycle
            .submit_task(
                &Identity::Admin,
                TaskSpec {
                    task_id: Some(id.into()),
                    kind: "media".to_string(),
                    payload: serde_json::json!({"input": format!("{id}.mp4")}),
                    target_node_id: None,
                    required_tags: BTreeSet::new(),
                    priority,
                    max_attempts: None,
                    timeout_ms: Some(60_000),
                },
            )
            .await?;
    }

    // The worker pulls: highest priority first.
    let worker = Identity::Node(node_id.clone());
    let claimed = lifecycle
        .claim(&worker, &node_id)
        .await?
        .expect("a task is eligible");
    println!("claimed {} (attempt {})", claimed.task_id, claimed.attempt);

    lifecycle.ack(&worker, &claimed.task_id).await?;
    lifecycle
        .report_result(
            &worker,
            TaskResult {
                task_id: claimed.task_id.clone(),
                node_id: node_id.clone(),
                ok: true,
                output: Some(serde_json::json!({"seconds": 42})),
                error: None,
                finished_at: chrono::Utc::now(),
            },
        )
        .await?;

    let summary = runtime.summary().await?;
    println!("summary: {}", serde_json::to_string_pretty(&summary)?);

    runtime.shutdown().await
}
