//! Durable store backend on PostgreSQL.
//!
//! Task mutations are compare-and-set: every transition is a conditional
//! `UPDATE ... WHERE status = <expected>` whose affected-row count decides
//! whether the transition won. Claim selection reads the queued set in
//! claim order (`priority DESC, created_at ASC, task_id ASC`) under
//! `FOR UPDATE SKIP LOCKED`, so concurrent claimers on one instance never
//! pick the same row.
//!
//! Multi-instance deployments: the CAS guards prevent double-assignment,
//! but serializing `claim_task` across replicas (so lease recovery and
//! selection see a consistent queue) requires an external lock. A single
//! control-plane process needs nothing extra.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::claim;
use crate::clock::Clock;
use crate::error::{MeshError, MeshResult};
use crate::node::{FreshnessThresholds, Heartbeat, Node, NodeCapabilities, NodeId, NodeView};
use crate::store::Store;
use crate::task::{DlqEntry, DlqReason, Task, TaskId, TaskResult, TaskStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mesh_nodes (
    node_id        TEXT PRIMARY KEY,
    capabilities   JSONB NOT NULL,
    trusted        BOOLEAN NOT NULL,
    revoked        BOOLEAN NOT NULL,
    draining       BOOLEAN NOT NULL,
    last_heartbeat JSONB
);

CREATE TABLE IF NOT EXISTS mesh_tasks (
    task_id          TEXT PRIMARY KEY,
    kind             TEXT NOT NULL,
    payload          JSONB NOT NULL,
    target_node_id   TEXT,
    required_tags    JSONB NOT NULL,
    priority         INTEGER NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL,
    max_attempts     INTEGER NOT NULL,
    attempt          INTEGER NOT NULL,
    retry_after      TIMESTAMPTZ,
    timeout_ms       BIGINT,
    claimed_at       TIMESTAMPTZ,
    assigned_node_id TEXT,
    status           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS mesh_tasks_queued_idx
    ON mesh_tasks (priority DESC, created_at ASC, task_id ASC)
    WHERE status = 'queued';

CREATE TABLE IF NOT EXISTS mesh_results (
    task_id     TEXT PRIMARY KEY,
    node_id     TEXT NOT NULL,
    ok          BOOLEAN NOT NULL,
    output      JSONB,
    error       TEXT,
    finished_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS mesh_dlq (
    task_id     TEXT PRIMARY KEY,
    task        JSONB NOT NULL,
    last_result JSONB,
    reason      TEXT NOT NULL,
    enqueued_at TIMESTAMPTZ NOT NULL
);
"#;

/// PostgreSQL-backed implementation of [`Store`].
pub struct PostgresStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    freshness: FreshnessThresholds,
    claim_ttl_ms: u64,
}

fn storage(err: impl Into<anyhow::Error>) -> MeshError {
    MeshError::Storage(err.into())
}

fn status_to_str(status: TaskStatus) -> &'static str {
    status.as_str()
}

fn str_to_status(value: &str) -> MeshResult<TaskStatus> {
    match value {
        "queued" => Ok(TaskStatus::Queued),
        "claimed" => Ok(TaskStatus::Claimed),
        "running" => Ok(TaskStatus::Running),
        "done" => Ok(TaskStatus::Done),
        "failed" => Ok(TaskStatus::Failed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        other => Err(storage(anyhow::anyhow!("invalid task status: {other}"))),
    }
}

fn str_to_reason(value: &str) -> MeshResult<DlqReason> {
    match value {
        "max_attempts_exhausted" => Ok(DlqReason::MaxAttemptsExhausted),
        "timeout" => Ok(DlqReason::Timeout),
        other => Err(storage(anyhow::anyhow!("invalid dlq reason: {other}"))),
    }
}

impl PostgresStore {
    pub fn new(
        pool: PgPool,
        clock: Arc<dyn Clock>,
        freshness: FreshnessThresholds,
        claim_ttl_ms: u64,
    ) -> Self {
        Self {
            pool,
            clock,
            freshness,
            claim_ttl_ms,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> MeshResult<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }
        Ok(())
    }

    fn decode_task(row: &PgRow) -> MeshResult<Task> {
        let status: String = row.try_get("status").map_err(storage)?;
        let required_tags: serde_json::Value = row.try_get("required_tags").map_err(storage)?;
        Ok(Task {
            task_id: TaskId::new(row.try_get::<String, _>("task_id").map_err(storage)?),
            kind: row.try_get("kind").map_err(storage)?,
            payload: row.try_get("payload").map_err(storage)?,
            target_node_id: row
                .try_get::<Option<String>, _>("target_node_id")
                .map_err(storage)?
                .map(NodeId::new),
            required_tags: serde_json::from_value(required_tags).map_err(storage)?,
            priority: row.try_get("priority").map_err(storage)?,
            created_at: row.try_get("created_at").map_err(storage)?,
            max_attempts: row.try_get::<i32, _>("max_attempts").map_err(storage)? as u32,
            attempt: row.try_get::<i32, _>("attempt").map_err(storage)? as u32,
            retry_after: row.try_get("retry_after").map_err(storage)?,
            timeout_ms: row
                .try_get::<Option<i64>, _>("timeout_ms")
                .map_err(storage)?
                .map(|ms| ms as u64),
            claimed_at: row.try_get("claimed_at").map_err(storage)?,
            assigned_node_id: row
                .try_get::<Option<String>, _>("assigned_node_id")
                .map_err(storage)?
                .map(NodeId::new),
            status: str_to_status(&status)?,
            schema_version: crate::task::SCHEMA_VERSION.to_string(),
        })
    }

    fn decode_node(row: &PgRow) -> MeshResult<Node> {
        let capabilities: serde_json::Value = row.try_get("capabilities").map_err(storage)?;
        let capabilities: NodeCapabilities =
            serde_json::from_value(capabilities).map_err(storage)?;
        let heartbeat: Option<serde_json::Value> =
            row.try_get("last_heartbeat").map_err(storage)?;
        let last_heartbeat: Option<Heartbeat> = heartbeat
            .map(serde_json::from_value)
            .transpose()
            .map_err(storage)?;
        Ok(Node {
            node_id: NodeId::new(row.try_get::<String, _>("node_id").map_err(storage)?),
            capabilities,
            trusted: row.try_get("trusted").map_err(storage)?,
            revoked: row.try_get("revoked").map_err(storage)?,
            draining: row.try_get("draining").map_err(storage)?,
            last_heartbeat,
        })
    }

    fn decode_result(row: &PgRow) -> MeshResult<TaskResult> {
        Ok(TaskResult {
            task_id: TaskId::new(row.try_get::<String, _>("task_id").map_err(storage)?),
            node_id: NodeId::new(row.try_get::<String, _>("node_id").map_err(storage)?),
            ok: row.try_get("ok").map_err(storage)?,
            output: row.try_get("output").map_err(storage)?,
            error: row.try_get("error").map_err(storage)?,
            finished_at: row.try_get("finished_at").map_err(storage)?,
        })
    }

    fn decode_dlq(row: &PgRow) -> MeshResult<DlqEntry> {
        let task: serde_json::Value = row.try_get("task").map_err(storage)?;
        let last_result: Option<serde_json::Value> = row.try_get("last_result").map_err(storage)?;
        let reason: String = row.try_get("reason").map_err(storage)?;
        Ok(DlqEntry {
            task_id: TaskId::new(row.try_get::<String, _>("task_id").map_err(storage)?),
            task: serde_json::from_value(task).map_err(storage)?,
            last_result: last_result
                .map(serde_json::from_value)
                .transpose()
                .map_err(storage)?,
            reason: str_to_reason(&reason)?,
            enqueued_at: row.try_get("enqueued_at").map_err(storage)?,
        })
    }

    fn view(&self, node: Node, now: DateTime<Utc>) -> NodeView {
        NodeView::of(node, now, &self.freshness)
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("claim_ttl_ms", &self.claim_ttl_ms)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_node(&self, node: Node) -> MeshResult<NodeView> {
        let now = self.clock.now();
        let capabilities = serde_json::to_value(&node.capabilities).map_err(storage)?;
        let heartbeat = node
            .last_heartbeat
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(storage)?;

        let row = sqlx::query(
            r#"
            INSERT INTO mesh_nodes (node_id, capabilities, trusted, revoked, draining, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (node_id) DO UPDATE SET capabilities = EXCLUDED.capabilities
            RETURNING node_id, capabilities, trusted, revoked, draining, last_heartbeat
            "#,
        )
        .bind(node.node_id.as_str())
        .bind(&capabilities)
        .bind(node.trusted)
        .bind(node.revoked)
        .bind(node.draining)
        .bind(&heartbeat)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        Ok(self.view(Self::decode_node(&row)?, now))
    }

    async fn set_heartbeat(&self, node_id: &NodeId, heartbeat: Heartbeat) -> MeshResult<()> {
        let heartbeat = serde_json::to_value(&heartbeat).map_err(storage)?;
        let updated = sqlx::query("UPDATE mesh_nodes SET last_heartbeat = $1 WHERE node_id = $2")
            .bind(&heartbeat)
            .bind(node_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if updated.rows_affected() == 0 {
            return Err(MeshError::UnknownNode(node_id.clone()));
        }
        Ok(())
    }

    async fn set_node_trust(
        &self,
        node_id: &NodeId,
        trusted: Option<bool>,
        revoked: Option<bool>,
    ) -> MeshResult<NodeView> {
        let now = self.clock.now();
        let row = sqlx::query(
            r#"
            UPDATE mesh_nodes
            SET trusted = COALESCE($1, trusted),
                revoked = COALESCE($2, revoked)
            WHERE node_id = $3
            RETURNING node_id, capabilities, trusted, revoked, draining, last_heartbeat
            "#,
        )
        .bind(trusted)
        .bind(revoked)
        .bind(node_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        .ok_or_else(|| MeshError::UnknownNode(node_id.clone()))?;

        Ok(self.view(Self::decode_node(&row)?, now))
    }

    async fn set_node_drain(&self, node_id: &NodeId, draining: bool) -> MeshResult<NodeView> {
        let now = self.clock.now();
        let row = sqlx::query(
            r#"
            UPDATE mesh_nodes SET draining = $1 WHERE node_id = $2
            RETURNING node_id, capabilities, trusted, revoked, draining, last_heartbeat
            "#,
        )
        .bind(draining)
        .bind(node_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        .ok_or_else(|| MeshError::UnknownNode(node_id.clone()))?;

        Ok(self.view(Self::decode_node(&row)?, now))
    }

    async fn get_node(&self, node_id: &NodeId) -> MeshResult<Option<NodeView>> {
        let now = self.clock.now();
        let row = sqlx::query(
            "SELECT node_id, capabilities, trusted, revoked, draining, last_heartbeat
             FROM mesh_nodes WHERE node_id = $1",
        )
        .bind(node_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|row| Ok(self.view(Self::decode_node(&row)?, now)))
            .transpose()
    }

    async fn list_nodes(&self) -> MeshResult<Vec<NodeView>> {
        let now = self.clock.now();
        let rows = sqlx::query(
            "SELECT node_id, capabilities, trusted, revoked, draining, last_heartbeat
             FROM mesh_nodes ORDER BY node_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| Ok(self.view(Self::decode_node(row)?, now)))
            .collect()
    }

    async fn enqueue_task(&self, task: Task) -> MeshResult<Task> {
        let required_tags = serde_json::to_value(&task.required_tags).map_err(storage)?;
        sqlx::query(
            r#"
            INSERT INTO mesh_tasks (
                task_id, kind, payload, target_node_id, required_tags, priority,
                created_at, max_attempts, attempt, retry_after, timeout_ms,
                claimed_at, assigned_node_id, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NULL, NULL, 'queued')
            "#,
        )
        .bind(task.task_id.as_str())
        .bind(&task.kind)
        .bind(&task.payload)
        .bind(task.target_node_id.as_ref().map(|id| id.as_str()))
        .bind(&required_tags)
        .bind(task.priority)
        .bind(task.created_at)
        .bind(task.max_attempts as i32)
        .bind(task.attempt as i32)
        .bind(task.retry_after)
        .bind(task.timeout_ms.map(|ms| ms as i64))
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(task)
    }

    async fn claim_task(&self, node_id: &NodeId) -> MeshResult<Option<Task>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Lease recovery: stale claims return to the queue keeping their
        // attempt count.
        let cutoff = now - Duration::milliseconds(self.claim_ttl_ms as i64);
        sqlx::query(
            r#"
            UPDATE mesh_tasks
            SET status = 'queued', claimed_at = NULL, assigned_node_id = NULL
            WHERE status = 'claimed' AND claimed_at <= $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        let node_row = sqlx::query(
            "SELECT node_id, capabilities, trusted, revoked, draining, last_heartbeat
             FROM mesh_nodes WHERE node_id = $1",
        )
        .bind(node_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let Some(node_row) = node_row else {
            tx.commit().await.map_err(storage)?;
            return Ok(None);
        };
        let node = Self::decode_node(&node_row)?;
        let view = self.view(node.clone(), now);
        if !claim::node_claimable(&view) {
            tx.commit().await.map_err(storage)?;
            return Ok(None);
        }

        let in_flight: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM mesh_tasks
             WHERE assigned_node_id = $1 AND status IN ('claimed', 'running')",
        )
        .bind(node_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?
        .try_get("n")
        .map_err(storage)?;
        if in_flight >= node.capabilities.max_concurrent_tasks as i64 {
            tx.commit().await.map_err(storage)?;
            return Ok(None);
        }

        let node_tags = serde_json::to_value(&node.capabilities.tags).map_err(storage)?;
        let candidate = sqlx::query(
            r#"
            SELECT task_id, kind, payload, target_node_id, required_tags, priority,
                   created_at, max_attempts, attempt, retry_after, timeout_ms,
                   claimed_at, assigned_node_id, status
            FROM mesh_tasks
            WHERE status = 'queued'
              AND (retry_after IS NULL OR retry_after <= $1)
              AND (target_node_id IS NULL OR target_node_id = $2)
              AND required_tags <@ $3
            ORDER BY priority DESC, created_at ASC, task_id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(node_id.as_str())
        .bind(&node_tags)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let Some(candidate) = candidate else {
            tx.commit().await.map_err(storage)?;
            return Ok(None);
        };
        let candidate = Self::decode_task(&candidate)?;

        // Compare-and-set: the row is locked, but the status guard keeps
        // the transition honest if anything slipped in between.
        let claimed = sqlx::query(
            r#"
            UPDATE mesh_tasks
            SET status = 'claimed', claimed_at = $1, assigned_node_id = $2, attempt = attempt + 1
            WHERE task_id = $3 AND status = 'queued'
            "#,
        )
        .bind(now)
        .bind(node_id.as_str())
        .bind(candidate.task_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        if claimed.rows_affected() == 0 {
            tx.commit().await.map_err(storage)?;
            return Ok(None);
        }

        tx.commit().await.map_err(storage)?;

        let mut task = candidate;
        task.status = TaskStatus::Claimed;
        task.claimed_at = Some(now);
        task.assigned_node_id = Some(node_id.clone());
        task.attempt += 1;
        Ok(Some(task))
    }

    async fn get_task(&self, task_id: &TaskId) -> MeshResult<Option<Task>> {
        let row = sqlx::query(
            r#"
            SELECT task_id, kind, payload, target_node_id, required_tags, priority,
                   created_at, max_attempts, attempt, retry_after, timeout_ms,
                   claimed_at, assigned_node_id, status
            FROM mesh_tasks WHERE task_id = $1
            "#,
        )
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(Self::decode_task).transpose()
    }

    async fn list_tasks(&self) -> MeshResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, kind, payload, target_node_id, required_tags, priority,
                   created_at, max_attempts, attempt, retry_after, timeout_ms,
                   claimed_at, assigned_node_id, status
            FROM mesh_tasks ORDER BY created_at ASC, task_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(Self::decode_task).collect()
    }

    async fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) -> MeshResult<Task> {
        let clear = status.is_terminal();
        let row = sqlx::query(
            r#"
            UPDATE mesh_tasks
            SET status = $1,
                claimed_at = CASE WHEN $2 THEN NULL ELSE claimed_at END,
                assigned_node_id = CASE WHEN $2 THEN NULL ELSE assigned_node_id END
            WHERE task_id = $3 AND status NOT IN ('done', 'failed', 'cancelled')
            RETURNING task_id, kind, payload, target_node_id, required_tags, priority,
                      created_at, max_attempts, attempt, retry_after, timeout_ms,
                      claimed_at, assigned_node_id, status
            "#,
        )
        .bind(status_to_str(status))
        .bind(clear)
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => Self::decode_task(&row),
            None => match self.get_task(task_id).await? {
                Some(_) => Err(MeshError::TaskAlreadyTerminal(task_id.clone())),
                None => Err(MeshError::TaskNotFound(task_id.clone())),
            },
        }
    }

    async fn cancel_task(&self, task_id: &TaskId) -> MeshResult<bool> {
        let cancelled = sqlx::query(
            r#"
            UPDATE mesh_tasks
            SET status = 'cancelled', claimed_at = NULL, assigned_node_id = NULL
            WHERE task_id = $1 AND status NOT IN ('done', 'failed', 'cancelled')
            "#,
        )
        .bind(task_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if cancelled.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_task(task_id).await? {
            Some(_) => Ok(false),
            None => Err(MeshError::TaskNotFound(task_id.clone())),
        }
    }

    async fn requeue_for_retry(
        &self,
        task_id: &TaskId,
        retry_after: DateTime<Utc>,
    ) -> MeshResult<Task> {
        let row = sqlx::query(
            r#"
            UPDATE mesh_tasks
            SET status = 'queued', claimed_at = NULL, assigned_node_id = NULL, retry_after = $1
            WHERE task_id = $2 AND status IN ('claimed', 'running')
            RETURNING task_id, kind, payload, target_node_id, required_tags, priority,
                      created_at, max_attempts, attempt, retry_after, timeout_ms,
                      claimed_at, assigned_node_id, status
            "#,
        )
        .bind(retry_after)
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => Self::decode_task(&row),
            None => match self.get_task(task_id).await? {
                Some(task) => Err(storage(anyhow::anyhow!(
                    "requeue_for_retry on {} task {task_id}",
                    task.status
                ))),
                None => Err(MeshError::TaskNotFound(task_id.clone())),
            },
        }
    }

    async fn set_task_result(&self, result: TaskResult) -> MeshResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO mesh_results (task_id, node_id, ok, output, error, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(result.task_id.as_str())
        .bind(result.node_id.as_str())
        .bind(result.ok)
        .bind(&result.output)
        .bind(&result.error)
        .bind(result.finished_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if inserted.rows_affected() == 0 {
            return Err(MeshError::TaskAlreadyTerminal(result.task_id));
        }
        Ok(())
    }

    async fn get_task_result(&self, task_id: &TaskId) -> MeshResult<Option<TaskResult>> {
        let row = sqlx::query(
            "SELECT task_id, node_id, ok, output, error, finished_at
             FROM mesh_results WHERE task_id = $1",
        )
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(Self::decode_result).transpose()
    }

    async fn enqueue_dlq(&self, entry: DlqEntry) -> MeshResult<()> {
        let task = serde_json::to_value(&entry.task).map_err(storage)?;
        let last_result = entry
            .last_result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(storage)?;
        sqlx::query(
            r#"
            INSERT INTO mesh_dlq (task_id, task, last_result, reason, enqueued_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (task_id) DO UPDATE
            SET task = EXCLUDED.task, last_result = EXCLUDED.last_result,
                reason = EXCLUDED.reason, enqueued_at = EXCLUDED.enqueued_at
            "#,
        )
        .bind(entry.task_id.as_str())
        .bind(&task)
        .bind(&last_result)
        .bind(entry.reason.as_str())
        .bind(entry.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn list_dlq(&self) -> MeshResult<Vec<DlqEntry>> {
        let rows = sqlx::query(
            "SELECT task_id, task, last_result, reason, enqueued_at
             FROM mesh_dlq ORDER BY enqueued_at ASC, task_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(Self::decode_dlq).collect()
    }

    async fn get_dlq_entry(&self, task_id: &TaskId) -> MeshResult<Option<DlqEntry>> {
        let row = sqlx::query(
            "SELECT task_id, task, last_result, reason, enqueued_at
             FROM mesh_dlq WHERE task_id = $1",
        )
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(Self::decode_dlq).transpose()
    }

    async fn requeue_from_dlq(&self, task_id: &TaskId) -> MeshResult<Task> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let removed = sqlx::query("DELETE FROM mesh_dlq WHERE task_id = $1 RETURNING task")
            .bind(task_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| MeshError::DlqEntryNotFound(task_id.clone()))?;

        let snapshot: serde_json::Value = removed.try_get("task").map_err(storage)?;
        let mut task: Task = serde_json::from_value(snapshot).map_err(storage)?;
        task.status = TaskStatus::Queued;
        task.attempt = 0;
        task.retry_after = None;
        task.claimed_at = None;
        task.assigned_node_id = None;

        let required_tags = serde_json::to_value(&task.required_tags).map_err(storage)?;
        sqlx::query(
            r#"
            INSERT INTO mesh_tasks (
                task_id, kind, payload, target_node_id, required_tags, priority,
                created_at, max_attempts, attempt, retry_after, timeout_ms,
                claimed_at, assigned_node_id, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, NULL, $9, NULL, NULL, 'queued')
            ON CONFLICT (task_id) DO UPDATE
            SET status = 'queued', attempt = 0, retry_after = NULL,
                claimed_at = NULL, assigned_node_id = NULL
            "#,
        )
        .bind(task.task_id.as_str())
        .bind(&task.kind)
        .bind(&task.payload)
        .bind(task.target_node_id.as_ref().map(|id| id.as_str()))
        .bind(&required_tags)
        .bind(task.priority)
        .bind(task.created_at)
        .bind(task.max_attempts as i32)
        .bind(task.timeout_ms.map(|ms| ms as i64))
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query("DELETE FROM mesh_results WHERE task_id = $1")
            .bind(task_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(task)
    }
}
