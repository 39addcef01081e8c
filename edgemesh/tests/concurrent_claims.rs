//! Concurrency tests for the claim engine.
//!
//! Races many claimers against one in-memory store and asserts the
//! linearizability contract: no task id is ever handed out twice without
//! an intervening lease expiry.

use std::collections::HashSet;
use std::sync::Arc;

use edgemesh::{Identity, MeshConfig, MeshRuntime, NodeId, TaskId};
use edgemesh_testkit::{node, task};
use parking_lot::Mutex;

const TASKS: usize = 200;
const NODES: usize = 4;
const CLAIMERS_PER_NODE: usize = 3;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claimers_never_double_assign() {
    let runtime = Arc::new(MeshRuntime::new(MeshConfig::default()).expect("runtime"));
    let lifecycle = runtime.lifecycle();

    let mut node_ids = Vec::new();
    for i in 0..NODES {
        let built = node(&format!("n{i}")).max_concurrent(1024).build();
        let node_id = built.node_id.clone();
        lifecycle
            .register_node(&Identity::Bootstrap, node_id.clone(), built.capabilities)
            .await
            .expect("register");
        lifecycle
            .heartbeat(
                &Identity::Node(node_id.clone()),
                &node_id,
                edgemesh_testkit::NodeBuilder::heartbeat(chrono::Utc::now()),
            )
            .await
            .expect("heartbeat");
        node_ids.push(node_id);
    }

    for i in 0..TASKS {
        lifecycle
            .submit_task(&Identity::Admin, task("job").id(&format!("t{i:04}")).build())
            .await
            .expect("submit");
    }

    let claimed: Arc<Mutex<Vec<TaskId>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for node_id in &node_ids {
        for _ in 0..CLAIMERS_PER_NODE {
            let lifecycle = runtime.lifecycle();
            let node_id: NodeId = node_id.clone();
            let claimed = Arc::clone(&claimed);
            handles.push(tokio::spawn(async move {
                loop {
                    match lifecycle
                        .claim(&Identity::Node(node_id.clone()), &node_id)
                        .await
                        .expect("claim")
                    {
                        Some(t) => claimed.lock().push(t.task_id),
                        None => break,
                    }
                }
            }));
        }
    }
    for result in futures::future::join_all(handles).await {
        result.expect("claimer finished");
    }

    let claimed = claimed.lock();
    assert_eq!(claimed.len(), TASKS, "every task was claimed exactly once");
    let unique: HashSet<&TaskId> = claimed.iter().collect();
    assert_eq!(unique.len(), TASKS, "no task id was handed out twice");

    let queued = runtime.queued_tasks().await.expect("queued");
    assert!(queued.is_empty(), "nothing left in the queue");
    let running = runtime.running_tasks().await.expect("running");
    assert_eq!(running.len(), TASKS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_are_all_claimable() {
    let runtime = Arc::new(MeshRuntime::new(MeshConfig::default()).expect("runtime"));
    let lifecycle = runtime.lifecycle();

    let built = node("n0").max_concurrent(1024).build();
    let node_id = built.node_id.clone();
    lifecycle
        .register_node(&Identity::Bootstrap, node_id.clone(), built.capabilities)
        .await
        .expect("register");
    lifecycle
        .heartbeat(
            &Identity::Node(node_id.clone()),
            &node_id,
            edgemesh_testkit::NodeBuilder::heartbeat(chrono::Utc::now()),
        )
        .await
        .expect("heartbeat");

    let mut producers = Vec::new();
    for p in 0..8 {
        let lifecycle = runtime.lifecycle();
        producers.push(tokio::spawn(async move {
            for i in 0..25 {
                lifecycle
                    .submit_task(
                        &Identity::Admin,
                        task("job").id(&format!("p{p}-t{i}")).build(),
                    )
                    .await
                    .expect("submit");
            }
        }));
    }
    for result in futures::future::join_all(producers).await {
        result.expect("producer finished");
    }

    let mut seen = HashSet::new();
    while let Some(t) = lifecycle
        .claim(&Identity::Node(node_id.clone()), &node_id)
        .await
        .expect("claim")
    {
        assert!(seen.insert(t.task_id.clone()), "duplicate claim");
    }
    assert_eq!(seen.len(), 200);
}
