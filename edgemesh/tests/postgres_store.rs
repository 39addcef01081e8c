//! Integration tests for the PostgreSQL store backend.
//!
//! Requires a running Postgres instance.
//! Run with: `DATABASE_URL=postgres://... cargo test --test postgres_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::sync::Arc;

use edgemesh::{
    FreshnessThresholds, Identity, MeshConfig, MeshRuntime, NodeId, PostgresStore, Store,
    SystemClock, TaskId, TaskStatus,
};
use edgemesh_testkit::{node, task, NodeBuilder};
use sqlx::postgres::PgPoolOptions;

async fn store() -> Arc<PostgresStore> {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL set for postgres tests");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect");
    let store = Arc::new(PostgresStore::new(
        pool,
        Arc::new(SystemClock),
        FreshnessThresholds::default(),
        30_000,
    ));
    store.migrate().await.expect("migrate");

    // Start from a clean slate; these tables are owned by the tests.
    for table in ["mesh_dlq", "mesh_results", "mesh_tasks", "mesh_nodes"] {
        sqlx::query(&format!("TRUNCATE {table}"))
            .execute(store.pool())
            .await
            .expect("truncate");
    }
    store
}

async fn runtime_on(store: Arc<PostgresStore>) -> MeshRuntime {
    MeshRuntime::builder(MeshConfig::default())
        .with_store(store)
        .build()
        .expect("runtime")
}

#[tokio::test]
#[ignore]
async fn claim_order_is_priority_then_fifo() {
    let store = store().await;
    let runtime = runtime_on(store).await;
    let lifecycle = runtime.lifecycle();

    let built = node("pg-n1").build();
    let node_id = built.node_id.clone();
    lifecycle
        .register_node(&Identity::Bootstrap, node_id.clone(), built.capabilities)
        .await
        .expect("register");
    lifecycle
        .heartbeat(
            &Identity::Node(node_id.clone()),
            &node_id,
            NodeBuilder::heartbeat(chrono::Utc::now()),
        )
        .await
        .expect("heartbeat");

    lifecycle
        .submit_task(&Identity::Admin, task("job").id("low").priority(1).build())
        .await
        .expect("submit");
    lifecycle
        .submit_task(&Identity::Admin, task("job").id("high").priority(10).build())
        .await
        .expect("submit");

    let first = lifecycle
        .claim(&Identity::Node(node_id.clone()), &node_id)
        .await
        .expect("claim")
        .expect("task");
    assert_eq!(first.task_id, TaskId::from("high"));
    assert_eq!(first.status, TaskStatus::Claimed);
    assert_eq!(first.attempt, 1);
}

#[tokio::test]
#[ignore]
async fn status_cas_rejects_terminal_transitions() {
    let store = store().await;

    store
        .upsert_node(node("pg-n1").beating_at(chrono::Utc::now()).build())
        .await
        .expect("node");
    let spec = task("job").id("t-cas").build();
    let queued = edgemesh::Task::from_spec(spec, TaskId::from("t-cas"), chrono::Utc::now());
    store.enqueue_task(queued).await.expect("enqueue");

    let claimed = store
        .claim_task(&NodeId::from("pg-n1"))
        .await
        .expect("claim")
        .expect("task");
    assert_eq!(claimed.task_id, TaskId::from("t-cas"));

    store
        .set_task_status(&TaskId::from("t-cas"), TaskStatus::Done)
        .await
        .expect("done");
    let err = store
        .set_task_status(&TaskId::from("t-cas"), TaskStatus::Running)
        .await
        .expect_err("terminal guard");
    assert_eq!(err.code(), "task_already_terminal");
}

#[tokio::test]
#[ignore]
async fn dlq_replay_round_trip() {
    let store = store().await;
    let runtime = runtime_on(store.clone()).await;
    let lifecycle = runtime.lifecycle();

    let built = node("pg-n1").build();
    let node_id = built.node_id.clone();
    lifecycle
        .register_node(&Identity::Bootstrap, node_id.clone(), built.capabilities)
        .await
        .expect("register");
    lifecycle
        .heartbeat(
            &Identity::Node(node_id.clone()),
            &node_id,
            NodeBuilder::heartbeat(chrono::Utc::now()),
        )
        .await
        .expect("heartbeat");

    let submitted = lifecycle
        .submit_task(&Identity::Admin, task("job").id("t-dlq").max_attempts(1).build())
        .await
        .expect("submit");
    lifecycle
        .claim(&Identity::Node(node_id.clone()), &node_id)
        .await
        .expect("claim")
        .expect("task");
    lifecycle
        .report_result(
            &Identity::Node(node_id.clone()),
            edgemesh::TaskResult {
                task_id: submitted.task_id.clone(),
                node_id: node_id.clone(),
                ok: false,
                output: None,
                error: Some("boom".to_string()),
                finished_at: chrono::Utc::now(),
            },
        )
        .await
        .expect("result");

    let entry = store
        .get_dlq_entry(&submitted.task_id)
        .await
        .expect("get")
        .expect("dead-lettered");
    assert_eq!(entry.reason.as_str(), "max_attempts_exhausted");

    let restored = lifecycle
        .replay_dlq(&Identity::Admin, &submitted.task_id)
        .await
        .expect("replay");
    assert_eq!(restored.status, TaskStatus::Queued);
    assert_eq!(restored.attempt, 0);
    assert!(store
        .get_task_result(&submitted.task_id)
        .await
        .expect("result get")
        .is_none());
}
