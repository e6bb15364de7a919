//! Processing queue store, §4.F — the heart of the system.
//!
//! `dequeue_next_task` is grounded on the teacher's `claim_pending_url`: a
//! `BEGIN IMMEDIATE` transaction that selects one eligible row, flips it to
//! `processing` in the same scope, and commits — so two workers racing the
//! same pool never claim the same task.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::ids;
use crate::models::{BackoffPolicy, ProcessingTask, QueueStatus, TaskCreate, TaskPriority, TaskStatus};
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};

use super::util::{column_datetime, column_datetime_opt, column_json, column_json_opt, now, to_json};

#[derive(Clone)]
pub struct QueueRepository {
    pool: DbPool,
    backoff: BackoffPolicy,
}

fn row_to_task(row: &Row) -> rusqlite::Result<ProcessingTask> {
    let id: String = row.get("id")?;
    let priority_raw: i64 = row.get("priority")?;
    let priority = TaskPriority::new(priority_raw as u8)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Integer, Box::new(e)))?;
    let status_raw: String = row.get("status")?;
    let status = TaskStatus::parse(&status_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let dependencies: Vec<String> = column_json(row, "dependencies")?;

    Ok(ProcessingTask {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        task_type: row.get("task_type")?,
        priority,
        payload: column_json(row, "payload")?,
        status,
        scheduled_at: column_datetime(row, "scheduled_at")?,
        worker_id: row.get("worker_id")?,
        started_at: column_datetime_opt(row, "started_at")?,
        completed_at: column_datetime_opt(row, "completed_at")?,
        failed_at: column_datetime_opt(row, "failed_at")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        error_message: row.get("error_message")?,
        dependencies: dependencies
            .into_iter()
            .map(|s| {
                Uuid::parse_str(&s).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                })
            })
            .collect::<rusqlite::Result<Vec<_>>>()?,
        result: column_json_opt(row, "result")?,
        created_at: column_datetime(row, "created_at")?,
        updated_at: column_datetime(row, "updated_at")?,
    })
}

impl QueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(pool: DbPool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }

    #[tracing::instrument(skip(self, task), fields(collection = "processing_tasks", op = "enqueue_task"))]
    pub async fn enqueue_task(&self, task: TaskCreate) -> Result<Uuid> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let task = task_clone(&task);
            async move {
                let id = ids::new_id();
                let now = now();
                let scheduled_at = task.scheduled_at.unwrap_or(now);
                pool.with_conn(move |conn| {
                    let dependencies: Vec<String> = task.dependencies.iter().map(Uuid::to_string).collect();
                    conn.execute(
                        "INSERT INTO processing_tasks (
                            id, task_type, priority, payload, status, scheduled_at, worker_id,
                            started_at, completed_at, failed_at, retry_count, max_retries,
                            error_message, dependencies, result, created_at, updated_at
                        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                        params![
                            id.to_string(),
                            task.task_type,
                            task.priority.value() as i64,
                            to_json(&task.payload)?,
                            TaskStatus::Pending.as_str(),
                            scheduled_at.to_rfc3339(),
                            Option::<String>::None,
                            Option::<String>::None,
                            Option::<String>::None,
                            Option::<String>::None,
                            0,
                            task.max_retries,
                            Option::<String>::None,
                            to_json(&dependencies)?,
                            Option::<String>::None,
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(id)
                })
                .await
            }
        })
        .await
    }

    /// Atomically claims the single highest-priority, earliest-scheduled,
    /// dependency-satisfied pending task and marks it `processing`.
    #[tracing::instrument(skip(self, worker_id), fields(collection = "processing_tasks", op = "dequeue_next_task"))]
    pub async fn dequeue_next_task(&self, worker_id: &str) -> Result<Option<ProcessingTask>> {
        let worker_id = worker_id.to_string();
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let worker_id = worker_id.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    conn.execute_batch("BEGIN IMMEDIATE").map_err(RepositoryError::from)?;

                    let result = (|| -> Result<Option<ProcessingTask>> {
                        let candidate: Option<(String, String)> = conn
                            .query_row(
                                "SELECT id, dependencies FROM processing_tasks
                                 WHERE status = 'pending' AND scheduled_at <= ?1
                                 ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                                 LIMIT 1",
                                params![now.to_rfc3339()],
                                |row| Ok((row.get(0)?, row.get(1)?)),
                            )
                            .optional()
                            .map_err(RepositoryError::from)?;

                        let Some((id, deps_json)) = candidate else {
                            return Ok(None);
                        };

                        let deps: Vec<String> = serde_json::from_str(&deps_json).map_err(RepositoryError::from)?;
                        for dep_id in &deps {
                            let dep_status: Option<String> = conn
                                .query_row(
                                    "SELECT status FROM processing_tasks WHERE id = ?1",
                                    params![dep_id],
                                    |row| row.get(0),
                                )
                                .optional()
                                .map_err(RepositoryError::from)?;
                            if dep_status.as_deref() != Some("completed") {
                                // Dependency unmet: leave this task pending, claim nothing this round.
                                return Ok(None);
                            }
                        }

                        conn.execute(
                            "UPDATE processing_tasks SET status = ?1, worker_id = ?2, started_at = ?3, updated_at = ?4
                             WHERE id = ?5",
                            params![
                                TaskStatus::Processing.as_str(),
                                worker_id,
                                now.to_rfc3339(),
                                now.to_rfc3339(),
                                id,
                            ],
                        )
                        .map_err(RepositoryError::from)?;

                        let task = conn
                            .query_row("SELECT * FROM processing_tasks WHERE id = ?1", params![id], row_to_task)
                            .map_err(RepositoryError::from)?;
                        Ok(Some(task))
                    })();

                    match result {
                        Ok(value) => {
                            conn.execute_batch("COMMIT").map_err(RepositoryError::from)?;
                            Ok(value)
                        }
                        Err(e) => {
                            conn.execute_batch("ROLLBACK").ok();
                            Err(e)
                        }
                    }
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, worker_id), fields(collection = "processing_tasks", op = "mark_task_processing"))]
    pub async fn mark_task_processing(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let worker_id = worker_id.to_string();
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let worker_id = worker_id.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    conn.execute(
                        "UPDATE processing_tasks SET status = ?1, worker_id = ?2, started_at = ?3, updated_at = ?4 WHERE id = ?5",
                        params![
                            TaskStatus::Processing.as_str(),
                            worker_id,
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                            id.to_string(),
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, result), fields(collection = "processing_tasks", op = "complete_task"))]
    pub async fn complete_task(&self, id: Uuid, result: serde_json::Value) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let result = result.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    conn.execute(
                        "UPDATE processing_tasks SET status = ?1, result = ?2, completed_at = ?3, updated_at = ?4 WHERE id = ?5",
                        params![
                            TaskStatus::Completed.as_str(),
                            to_json(&result)?,
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                            id.to_string(),
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    /// Fails a task. If `retry_count < max_retries` it is rescheduled with
    /// exponential backoff and returned to `pending`; otherwise it moves to
    /// the terminal `failed` status.
    #[tracing::instrument(skip(self, error_message), fields(collection = "processing_tasks", op = "fail_task"))]
    pub async fn fail_task(&self, id: Uuid, error_message: String) -> Result<()> {
        let pool = self.pool.clone();
        let backoff = self.backoff;
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let error_message = error_message.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    let (retry_count, max_retries): (u32, u32) = conn.query_row(
                        "SELECT retry_count, max_retries FROM processing_tasks WHERE id = ?1",
                        params![id.to_string()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?;
                    if retry_count >= max_retries {
                        conn.execute(
                            "UPDATE processing_tasks SET status = ?1, error_message = ?2, failed_at = ?3, updated_at = ?4 WHERE id = ?5",
                            params![
                                TaskStatus::Failed.as_str(),
                                error_message,
                                now.to_rfc3339(),
                                now.to_rfc3339(),
                                id.to_string(),
                            ],
                        )
                        .map_err(RepositoryError::from)?;
                    } else {
                        let delay = backoff.delay_seconds(retry_count);
                        let scheduled_at = now + chrono::Duration::seconds(delay);
                        let next_retry = retry_count + 1;
                        conn.execute(
                            "UPDATE processing_tasks SET status = ?1, retry_count = ?2, error_message = ?3,
                             scheduled_at = ?4, worker_id = NULL, updated_at = ?5 WHERE id = ?6",
                            params![
                                TaskStatus::Pending.as_str(),
                                next_retry,
                                error_message,
                                scheduled_at.to_rfc3339(),
                                now.to_rfc3339(),
                                id.to_string(),
                            ],
                        )
                        .map_err(RepositoryError::from)?;
                    }
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "processing_tasks", op = "retry_failed_tasks"))]
    pub async fn retry_failed_tasks(&self, task_type: Option<String>) -> Result<u64> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let task_type = task_type.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    let affected = match task_type {
                        Some(task_type) => conn.execute(
                            "UPDATE processing_tasks SET status = ?1, retry_count = 0, scheduled_at = ?2, updated_at = ?3
                             WHERE status = 'failed' AND task_type = ?4",
                            params![TaskStatus::Pending.as_str(), now.to_rfc3339(), now.to_rfc3339(), task_type],
                        ),
                        None => conn.execute(
                            "UPDATE processing_tasks SET status = ?1, retry_count = 0, scheduled_at = ?2, updated_at = ?3
                             WHERE status = 'failed'",
                            params![TaskStatus::Pending.as_str(), now.to_rfc3339(), now.to_rfc3339()],
                        ),
                    }
                    .map_err(RepositoryError::from)?;
                    Ok(affected as u64)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "processing_tasks", op = "get_queue_status"))]
    pub async fn get_queue_status(&self) -> Result<QueueStatus> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut status = QueueStatus::default();
                    let mut stmt =
                        conn.prepare("SELECT status, COUNT(*) FROM processing_tasks GROUP BY status")?;
                    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
                    for row in rows {
                        let (state, count) = row?;
                        match state.as_str() {
                            "pending" => status.pending = count as u64,
                            "processing" => status.processing = count as u64,
                            "completed" => status.completed = count as u64,
                            "failed" => status.failed = count as u64,
                            _ => {}
                        }
                    }
                    status.oldest_pending_created_at = conn
                        .query_row(
                            "SELECT MIN(created_at) FROM processing_tasks WHERE status = 'pending'",
                            [],
                            |row| row.get::<_, Option<String>>(0),
                        )?
                        .map(|s| super::util::parse_datetime(&s))
                        .transpose()?;
                    status.average_completed_duration_seconds = conn
                        .query_row(
                            "SELECT AVG(
                                (julianday(completed_at) - julianday(started_at)) * 86400.0
                             ) FROM processing_tasks WHERE status = 'completed' AND started_at IS NOT NULL",
                            [],
                            |row| row.get(0),
                        )
                        .optional()?
                        .flatten();
                    Ok(status)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "processing_tasks", op = "get_stale_processing_tasks"))]
    pub async fn get_stale_processing_tasks(&self, lease_timeout: chrono::Duration) -> Result<Vec<ProcessingTask>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                let cutoff = now() - lease_timeout;
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM processing_tasks WHERE status = 'processing' AND started_at < ?1",
                    )?;
                    let tasks = stmt
                        .query_map(params![cutoff.to_rfc3339()], row_to_task)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(tasks)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "processing_tasks", op = "purge_completed_tasks"))]
    pub async fn purge_completed_tasks(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let affected = conn
                        .execute(
                            "DELETE FROM processing_tasks WHERE status = 'completed' AND completed_at < ?1",
                            params![older_than.to_rfc3339()],
                        )
                        .map_err(RepositoryError::from)?;
                    Ok(affected as u64)
                })
                .await
            }
        })
        .await
    }
}

fn task_clone(task: &TaskCreate) -> TaskCreate {
    TaskCreate {
        task_type: task.task_type.clone(),
        priority: task.priority,
        payload: task.payload.clone(),
        scheduled_at: task.scheduled_at,
        max_retries: task.max_retries,
        dependencies: task.dependencies.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task(priority: u8) -> TaskCreate {
        TaskCreate {
            task_type: "extract".into(),
            priority: TaskPriority::new(priority).unwrap(),
            payload: serde_json::json!({}),
            scheduled_at: None,
            max_retries: 3,
            dependencies: vec![],
        }
    }

    async fn setup() -> QueueRepository {
        let pool = DbPool::open_in_memory().unwrap();
        crate::repository::migrations::migrate(&pool).await.unwrap();
        QueueRepository::new(pool)
    }

    #[tokio::test]
    async fn dequeue_returns_highest_priority_first() {
        let repo = setup().await;
        repo.enqueue_task(make_task(1)).await.unwrap();
        let high_id = repo.enqueue_task(make_task(5)).await.unwrap();
        let claimed = repo.dequeue_next_task("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, high_id);
        assert_eq!(claimed.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn dequeue_is_exclusive_across_concurrent_claims() {
        let repo = setup().await;
        repo.enqueue_task(make_task(3)).await.unwrap();
        let first = repo.dequeue_next_task("worker-1").await.unwrap();
        let second = repo.dequeue_next_task("worker-2").await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn fail_task_reschedules_with_backoff_until_max_retries() {
        let repo = setup().await;
        let id = repo
            .enqueue_task(TaskCreate {
                max_retries: 2,
                ..make_task(1)
            })
            .await
            .unwrap();
        repo.dequeue_next_task("worker-1").await.unwrap();
        repo.fail_task(id, "boom".into()).await.unwrap();
        let status = repo.get_queue_status().await.unwrap();
        assert_eq!(status.pending, 1);

        repo.dequeue_next_task("worker-1").await.unwrap();
        repo.fail_task(id, "boom again".into()).await.unwrap();
        let status = repo.get_queue_status().await.unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 0);
    }

    #[tokio::test]
    async fn dependency_gate_blocks_dequeue_until_dependency_completes() {
        let repo = setup().await;
        let dep_id = repo.enqueue_task(make_task(1)).await.unwrap();
        repo.enqueue_task(TaskCreate {
            dependencies: vec![dep_id],
            ..make_task(5)
        })
        .await
        .unwrap();

        let claimed = repo.dequeue_next_task("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, dep_id);
    }
}
