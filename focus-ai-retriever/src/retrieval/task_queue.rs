//! Persistent priority task queue.
//!
//! Tasks live in the `tasks` table so they survive restarts. Workers pull work with
//! [`TaskQueue::claim_next`], which moves exactly one PENDING task to RUNNING in a single
//! `UPDATE … RETURNING` statement: the claim is the only serialization point between workers.
//!
//! Ordering is strict priority (HIGH before MEDIUM before LOW) with FIFO by insertion id inside a
//! band. A failed task that may be retried is pushed back to PENDING with an `available_at` gate so
//! it is not picked up again before its backoff has elapsed.
//!
//! ```text
//!            claim_next            complete
//! PENDING ──────────────▶ RUNNING ───────────▶ DONE
//!    ▲  │                  │  │
//!    │  │ cancel     fail  │  │ cancel_requested → mark_cancelled
//!    │  ▼   (retryable,    │  ▼
//!    │ CANCELLED  attempts │ CANCELLED / FAILED
//!    └────────────────────┘
//! ```

use crate::config::QueueConfig;
use crate::error::{CoreError, Result};
use crate::storage::{Database, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Priority levels for tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    /// Background work such as reconciliation sweeps
    Low = 0,
    /// Ordinary document submissions
    Medium = 1,
    /// Work a user is actively waiting on, e.g. a freshly pinned document
    High = 2,
}

impl TaskPriority {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(TaskPriority::Low),
            1 => Ok(TaskPriority::Medium),
            2 => Ok(TaskPriority::High),
            other => Err(CoreError::Consistency(format!("unknown task priority {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "LOW",
            TaskPriority::Medium => "MEDIUM",
            TaskPriority::High => "HIGH",
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(TaskPriority::Low),
            "MEDIUM" => Ok(TaskPriority::Medium),
            "HIGH" => Ok(TaskPriority::High),
            other => Err(CoreError::validation(format!("unknown priority {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    /// DONE, FAILED and CANCELLED never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "DONE" => Ok(TaskStatus::Done),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            other => Err(CoreError::validation(format!("unknown task status {other}"))),
        }
    }
}

/// Types of tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    IngestDocument,
    DeleteDocument,
    ReconcileIndex,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::IngestDocument => "INGEST_DOCUMENT",
            TaskKind::DeleteDocument => "DELETE_DOCUMENT",
            TaskKind::ReconcileIndex => "RECONCILE_INDEX",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INGEST_DOCUMENT" => Ok(TaskKind::IngestDocument),
            "DELETE_DOCUMENT" => Ok(TaskKind::DeleteDocument),
            "RECONCILE_INDEX" => Ok(TaskKind::ReconcileIndex),
            other => Err(CoreError::validation(format!("unknown task kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestPayload {
    pub document_id: i64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeletePayload {
    pub document_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcilePayload {}

/// A payload checked against its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    Ingest(IngestPayload),
    Delete(DeletePayload),
    Reconcile(ReconcilePayload),
}

impl TaskPayload {
    /// Parse and validate `value` as the payload of a `kind` task.
    pub fn parse(kind: TaskKind, value: &Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            CoreError::validation(format!("malformed {kind} payload: {e}"))
        };
        let payload = match kind {
            TaskKind::IngestDocument => {
                TaskPayload::Ingest(serde_json::from_value(value.clone()).map_err(invalid)?)
            }
            TaskKind::DeleteDocument => {
                TaskPayload::Delete(serde_json::from_value(value.clone()).map_err(invalid)?)
            }
            TaskKind::ReconcileIndex => {
                TaskPayload::Reconcile(serde_json::from_value(value.clone()).map_err(invalid)?)
            }
        };
        match &payload {
            TaskPayload::Ingest(p) if p.path.trim().is_empty() => {
                Err(CoreError::validation("ingest payload has an empty path"))
            }
            TaskPayload::Ingest(IngestPayload { document_id, .. })
            | TaskPayload::Delete(DeletePayload { document_id })
                if *document_id <= 0 =>
            {
                Err(CoreError::validation(format!(
                    "{kind} payload has invalid document_id {document_id}"
                )))
            }
            _ => Ok(payload),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Ingest(_) => TaskKind::IngestDocument,
            TaskPayload::Delete(_) => TaskKind::DeleteDocument,
            TaskPayload::Reconcile(_) => TaskKind::ReconcileIndex,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            TaskPayload::Ingest(p) => serde_json::to_value(p)?,
            TaskPayload::Delete(p) => serde_json::to_value(p)?,
            TaskPayload::Reconcile(p) => serde_json::to_value(p)?,
        })
    }
}

/// A snapshot of one task row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: i64,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub payload: Value,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub error_message: Option<String>,
    pub result: Option<Value>,
    pub cancel_requested: bool,
    /// Not claimable before this instant (Unix ms)
    pub available_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
}

impl Task {
    pub fn typed_payload(&self) -> Result<TaskPayload> {
        TaskPayload::parse(self.kind, &self.payload)
    }

    /// Get a description of the task for logging
    pub fn description(&self) -> String {
        match self.typed_payload() {
            Ok(TaskPayload::Ingest(p)) => {
                format!("task {} ingest document {} ({})", self.id, p.document_id, p.path)
            }
            Ok(TaskPayload::Delete(p)) => {
                format!("task {} delete document {}", self.id, p.document_id)
            }
            Ok(TaskPayload::Reconcile(_)) => format!("task {} reconcile index", self.id),
            Err(_) => format!("task {} {}", self.id, self.kind),
        }
    }
}

/// Which priority bands a worker may claim: everything at or above `min_priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCapacity {
    pub min_priority: TaskPriority,
}

impl WorkerCapacity {
    pub fn at_least(min_priority: TaskPriority) -> Self {
        Self { min_priority }
    }

    /// A dedicated HIGH worker.
    pub fn high_only() -> Self {
        Self::at_least(TaskPriority::High)
    }

    pub fn any() -> Self {
        Self::at_least(TaskPriority::Low)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.done + self.failed + self.cancelled
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let payload: String = row.get("payload");
    let result: Option<String> = row.get("result_json");
    let attempt_count: i64 = row.get("attempt_count");
    let cancel_requested: i64 = row.get("cancel_requested");

    Ok(Task {
        id: row.get("id"),
        kind: kind.parse()?,
        priority: TaskPriority::from_i64(row.get("priority"))?,
        payload: serde_json::from_str(&payload)?,
        status: status.parse()?,
        attempt_count: attempt_count.max(0) as u32,
        error_message: row.get("error_message"),
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        cancel_requested: cancel_requested != 0,
        available_at: row.get("available_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
    })
}

/// Handle to the persistent queue. Cheap to clone; every clone sees the same table.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    db: Database,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(db: Database, config: QueueConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a task. The payload is validated against `kind` before anything is written.
    pub async fn enqueue(
        &self,
        kind: TaskKind,
        payload: &Value,
        priority: TaskPriority,
    ) -> Result<i64> {
        TaskPayload::parse(kind, payload)?;
        let now = now_millis();
        let id = sqlx::query(
            r#"
            INSERT INTO tasks (kind, priority, payload, status, attempt_count, cancel_requested,
                               available_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'PENDING', 0, 0, ?4, ?4, ?4)
            "#,
        )
        .bind(kind.as_str())
        .bind(priority.as_i64())
        .bind(serde_json::to_string(payload)?)
        .bind(now)
        .execute(self.db.pool())
        .await?
        .last_insert_rowid();

        debug!("Enqueued task {} {} at {}", id, kind, priority);
        Ok(id)
    }

    pub async fn enqueue_payload(&self, payload: &TaskPayload, priority: TaskPriority) -> Result<i64> {
        self.enqueue(payload.kind(), &payload.to_value()?, priority)
            .await
    }

    /// Atomically claim the next claimable task for a worker with `capacity`.
    pub async fn claim_next(&self, capacity: WorkerCapacity) -> Result<Option<Task>> {
        let now = now_millis();
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'RUNNING', started_at = ?1, updated_at = ?1
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'PENDING' AND available_at <= ?1 AND priority >= ?2
                ORDER BY priority DESC, id ASC
                LIMIT 1
            ) AND status = 'PENDING'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(capacity.min_priority.as_i64())
        .fetch_optional(self.db.pool())
        .await?;

        let task = row.as_ref().map(task_from_row).transpose()?;
        if let Some(task) = &task {
            debug!("Claimed {} (attempt {})", task.description(), task.attempt_count + 1);
        }
        Ok(task)
    }

    /// RUNNING → DONE.
    pub async fn complete(&self, task_id: i64, result: &Value) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks SET status = 'DONE', result_json = ?1, error_message = NULL, updated_at = ?2
            WHERE id = ?3 AND status = 'RUNNING'
            "#,
        )
        .bind(serde_json::to_string(result)?)
        .bind(now_millis())
        .bind(task_id)
        .execute(self.db.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(self.not_running(task_id).await);
        }
        Ok(())
    }

    /// Record a failure of a RUNNING task and return its new status.
    ///
    /// Every call adds exactly one to `attempt_count`. A retryable error with attempts left puts
    /// the task back to PENDING behind an exponential backoff gate; anything else is terminal
    /// FAILED. A task whose cancellation was requested ends CANCELLED instead of being retried.
    pub async fn fail(&self, task_id: i64, error: &CoreError) -> Result<TaskStatus> {
        let current = self
            .get(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id))?;
        if current.status != TaskStatus::Running {
            return Err(self.not_running(task_id).await);
        }

        let attempts = current.attempt_count + 1;
        let requeue = error.is_retryable() && attempts < self.config.max_retries;
        let now = now_millis();
        let available_at = if requeue {
            now + self.config.backoff_for(attempts).as_millis() as i64
        } else {
            now
        };

        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE tasks
            SET attempt_count = ?1,
                status = CASE WHEN cancel_requested = 1 THEN 'CANCELLED'
                              WHEN ?2 THEN 'PENDING'
                              ELSE 'FAILED' END,
                available_at = ?3,
                error_message = ?4,
                started_at = NULL,
                updated_at = ?5
            WHERE id = ?6 AND status = 'RUNNING' AND attempt_count = ?7
            RETURNING status
            "#,
        )
        .bind(attempts as i64)
        .bind(requeue)
        .bind(available_at)
        .bind(error.to_string())
        .bind(now)
        .bind(task_id)
        .bind(current.attempt_count as i64)
        .fetch_optional(self.db.pool())
        .await?;

        let status: TaskStatus = match status {
            Some(s) => s.parse()?,
            None => return Err(self.not_running(task_id).await),
        };
        match status {
            TaskStatus::Pending => warn!(
                "Task {} failed (attempt {}/{}), retrying in {:?}: {}",
                task_id,
                attempts,
                self.config.max_retries,
                self.config.backoff_for(attempts),
                error
            ),
            _ => warn!(
                "Task {} is {} after {} attempt(s): {}",
                task_id, status, attempts, error
            ),
        }
        Ok(status)
    }

    /// Cancel a task. A PENDING task is cancelled at once; a RUNNING task is flagged and its
    /// worker finishes the cancellation at its next checkpoint. Returns the status after the call.
    pub async fn cancel(&self, task_id: i64) -> Result<TaskStatus> {
        let now = now_millis();
        let cancelled = sqlx::query(
            "UPDATE tasks SET status = 'CANCELLED', updated_at = ?1 WHERE id = ?2 AND status = 'PENDING'",
        )
        .bind(now)
        .bind(task_id)
        .execute(self.db.pool())
        .await?;
        if cancelled.rows_affected() > 0 {
            info!("Task {} cancelled", task_id);
            return Ok(TaskStatus::Cancelled);
        }

        let flagged = sqlx::query(
            "UPDATE tasks SET cancel_requested = 1, updated_at = ?1 WHERE id = ?2 AND status = 'RUNNING'",
        )
        .bind(now)
        .bind(task_id)
        .execute(self.db.pool())
        .await?;
        if flagged.rows_affected() > 0 {
            info!("Cancellation requested for running task {}", task_id);
            return Ok(TaskStatus::Running);
        }

        match self.get(task_id).await? {
            None => Err(CoreError::not_found("task", task_id)),
            Some(task) => Err(CoreError::validation(format!(
                "task {task_id} is already {}",
                task.status
            ))),
        }
    }

    /// Checkpoint used by workers between units of work.
    pub async fn is_cancel_requested(&self, task_id: i64) -> Result<bool> {
        let flag: Option<i64> =
            sqlx::query_scalar("SELECT cancel_requested FROM tasks WHERE id = ?1")
                .bind(task_id)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// RUNNING → CANCELLED, called by the worker that observed the flag.
    pub async fn mark_cancelled(&self, task_id: i64) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'CANCELLED', started_at = NULL, updated_at = ?1 WHERE id = ?2 AND status = 'RUNNING'",
        )
        .bind(now_millis())
        .bind(task_id)
        .execute(self.db.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(self.not_running(task_id).await);
        }
        info!("Task {} cancelled by its worker", task_id);
        Ok(())
    }

    /// Put RUNNING tasks left behind by a crashed process back to PENDING. Call before any
    /// worker starts.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN cancel_requested = 1 THEN 'CANCELLED' ELSE 'PENDING' END,
                started_at = NULL, updated_at = ?1
            WHERE status = 'RUNNING'
            "#,
        )
        .bind(now_millis())
        .execute(self.db.pool())
        .await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("Recovered {} interrupted task(s)", recovered);
        }
        Ok(recovered)
    }

    pub async fn get(&self, task_id: i64) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Newest tasks first, optionally restricted to one status.
    pub async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM tasks WHERE status = ?1 ORDER BY id DESC LIMIT ?2")
                    .bind(status.as_str())
                    .bind(limit as i64)
                    .fetch_all(self.db.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY id DESC LIMIT ?1")
                    .bind(limit as i64)
                    .fetch_all(self.db.pool())
                    .await?
            }
        };
        rows.iter().map(task_from_row).collect()
    }

    pub async fn counts(&self) -> Result<TaskCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(self.db.pool())
            .await?;
        let mut counts = TaskCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            let n = n.max(0) as u64;
            match status.parse()? {
                TaskStatus::Pending => counts.pending = n,
                TaskStatus::Running => counts.running = n,
                TaskStatus::Done => counts.done = n,
                TaskStatus::Failed => counts.failed = n,
                TaskStatus::Cancelled => counts.cancelled = n,
            }
        }
        Ok(counts)
    }

    /// Whether a task of `kind` is waiting or running.
    pub async fn has_active(&self, kind: TaskKind) -> Result<bool> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE kind = ?1 AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(kind.as_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(n > 0)
    }

    /// Whether an ingest of `document_id` is waiting or running.
    pub async fn has_active_for_document(&self, document_id: i64) -> Result<bool> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE kind = ?1 AND status IN ('PENDING', 'RUNNING')
              AND json_extract(payload, '$.document_id') = ?2
            "#,
        )
        .bind(TaskKind::IngestDocument.as_str())
        .bind(document_id)
        .fetch_one(self.db.pool())
        .await?;
        Ok(n > 0)
    }

    async fn not_running(&self, task_id: i64) -> CoreError {
        match self.get(task_id).await {
            Ok(Some(task)) => CoreError::validation(format!(
                "task {task_id} is {}, not RUNNING",
                task.status
            )),
            Ok(None) => CoreError::not_found("task", task_id),
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn queue() -> TaskQueue {
        let db = Database::open_memory().await.unwrap();
        TaskQueue::new(
            db,
            QueueConfig {
                backoff_base_ms: 0,
                backoff_max_ms: 0,
                ..Default::default()
            },
        )
    }

    fn ingest(id: i64) -> Value {
        json!({ "document_id": id, "path": format!("/docs/{id}.md") })
    }

    #[tokio::test]
    async fn test_enqueue_validates_payload() {
        let q = queue().await;
        assert!(q.enqueue(TaskKind::IngestDocument, &ingest(1), TaskPriority::Medium).await.is_ok());

        for bad in [
            json!({ "document_id": 1 }),
            json!({ "document_id": 1, "path": "" }),
            json!({ "document_id": -4, "path": "/x" }),
            json!({ "document_id": 1, "path": "/x", "extra": true }),
            json!("not an object"),
        ] {
            let err = q
                .enqueue(TaskKind::IngestDocument, &bad, TaskPriority::Medium)
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{bad}: {err}");
        }
        assert_eq!(q.counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_claim_order_is_priority_then_fifo() {
        let q = queue().await;
        let h1 = q.enqueue(TaskKind::IngestDocument, &ingest(1), TaskPriority::High).await.unwrap();
        let l = q.enqueue(TaskKind::IngestDocument, &ingest(2), TaskPriority::Low).await.unwrap();
        let h2 = q.enqueue(TaskKind::IngestDocument, &ingest(3), TaskPriority::High).await.unwrap();
        let m = q.enqueue(TaskKind::IngestDocument, &ingest(4), TaskPriority::Medium).await.unwrap();

        let mut order = Vec::new();
        while let Some(task) = q.claim_next(WorkerCapacity::any()).await.unwrap() {
            assert_eq!(task.status, TaskStatus::Running);
            order.push(task.id);
        }
        assert_eq!(order, vec![h1, h2, m, l]);
    }

    #[tokio::test]
    async fn test_capacity_restricts_bands() {
        let q = queue().await;
        q.enqueue(TaskKind::ReconcileIndex, &json!({}), TaskPriority::Low).await.unwrap();
        assert!(q.claim_next(WorkerCapacity::high_only()).await.unwrap().is_none());
        assert!(q.claim_next(WorkerCapacity::at_least(TaskPriority::Medium)).await.unwrap().is_none());
        assert!(q.claim_next(WorkerCapacity::any()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_until_failed() {
        let q = queue().await;
        let id = q.enqueue(TaskKind::IngestDocument, &ingest(1), TaskPriority::Medium).await.unwrap();
        let transient = CoreError::transient("provider timed out");

        for expected_attempts in 1..=2 {
            q.claim_next(WorkerCapacity::any()).await.unwrap().unwrap();
            assert_eq!(q.fail(id, &transient).await.unwrap(), TaskStatus::Pending);
            let task = q.get(id).await.unwrap().unwrap();
            assert_eq!(task.attempt_count, expected_attempts);
        }

        q.claim_next(WorkerCapacity::any()).await.unwrap().unwrap();
        assert_eq!(q.fail(id, &transient).await.unwrap(), TaskStatus::Failed);
        let task = q.get(id).await.unwrap().unwrap();
        assert_eq!(task.attempt_count, 3);
        assert!(task.error_message.unwrap().contains("timed out"));
        assert!(q.claim_next(WorkerCapacity::any()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validation_errors_fail_immediately() {
        let q = queue().await;
        let id = q.enqueue(TaskKind::IngestDocument, &ingest(1), TaskPriority::Medium).await.unwrap();
        q.claim_next(WorkerCapacity::any()).await.unwrap().unwrap();
        let status = q
            .fail(id, &CoreError::DimensionMismatch { expected: 3, actual: 4 })
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(q.get(id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn test_backoff_gates_reclaim() {
        let db = Database::open_memory().await.unwrap();
        let q = TaskQueue::new(
            db,
            QueueConfig {
                backoff_base_ms: 60_000,
                backoff_max_ms: 60_000,
                ..Default::default()
            },
        );
        let id = q.enqueue(TaskKind::IngestDocument, &ingest(1), TaskPriority::High).await.unwrap();
        q.claim_next(WorkerCapacity::any()).await.unwrap().unwrap();
        q.fail(id, &CoreError::transient("busy")).await.unwrap();

        assert!(q.claim_next(WorkerCapacity::any()).await.unwrap().is_none());
        let task = q.get(id).await.unwrap().unwrap();
        assert!(task.available_at > now_millis() + 50_000);
    }

    #[tokio::test]
    async fn test_cancel_transitions() {
        let q = queue().await;
        let pending = q.enqueue(TaskKind::IngestDocument, &ingest(1), TaskPriority::Low).await.unwrap();
        let running = q.enqueue(TaskKind::IngestDocument, &ingest(2), TaskPriority::High).await.unwrap();

        assert_eq!(q.cancel(pending).await.unwrap(), TaskStatus::Cancelled);

        let claimed = q.claim_next(WorkerCapacity::any()).await.unwrap().unwrap();
        assert_eq!(claimed.id, running);
        assert_eq!(q.cancel(running).await.unwrap(), TaskStatus::Running);
        assert!(q.is_cancel_requested(running).await.unwrap());
        q.mark_cancelled(running).await.unwrap();
        assert_eq!(q.get(running).await.unwrap().unwrap().status, TaskStatus::Cancelled);

        // terminal tasks cannot be cancelled again
        assert!(matches!(q.cancel(pending).await, Err(CoreError::Validation(_))));
        assert!(matches!(q.cancel(9_999).await, Err(CoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_terminal_tasks_are_immutable() {
        let q = queue().await;
        let id = q.enqueue(TaskKind::ReconcileIndex, &json!({}), TaskPriority::Low).await.unwrap();
        q.claim_next(WorkerCapacity::any()).await.unwrap().unwrap();
        q.complete(id, &json!({ "repairs": 0 })).await.unwrap();

        assert!(q.complete(id, &json!({})).await.is_err());
        assert!(q.fail(id, &CoreError::transient("late")).await.is_err());
        assert!(q.mark_cancelled(id).await.is_err());
        let task = q.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.result, Some(json!({ "repairs": 0 })));
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let q = queue().await;
        let id = q.enqueue(TaskKind::IngestDocument, &ingest(1), TaskPriority::Medium).await.unwrap();
        q.claim_next(WorkerCapacity::any()).await.unwrap().unwrap();

        assert_eq!(q.recover_interrupted().await.unwrap(), 1);
        let task = q.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
        assert!(q.has_active(TaskKind::IngestDocument).await.unwrap());
        assert!(q.has_active_for_document(1).await.unwrap());
        assert!(!q.has_active_for_document(2).await.unwrap());
    }
}
