//! Background Task Ledger.
//!
//! One row per dispatched job, keyed by the queue's job id. The ledger is the
//! relational side of a job; the queue holds the live side (status, reported
//! progress). [`progress`] reconciles the two.
//!
//! [`launch`] enqueues before the ledger row is written on the caller's
//! transaction. If that transaction later rolls back, the job still runs with
//! no ledger row behind it. The worker tolerates this: completing a job whose
//! ledger row is missing updates nothing.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sqlx::{SqliteConnection, SqliteExecutor};

use crate::models::Task;
use crate::queue::JobQueue;

/// A ledger row together with its reconciled progress.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    #[serde(flatten)]
    pub task: Task,
    pub progress: i64,
}

/// Enqueues `name` for `user_id` and records the ledger row on `conn`.
pub async fn launch(
    conn: &mut SqliteConnection,
    queue: &dyn JobQueue,
    user_id: i64,
    name: &str,
    description: &str,
    args: Value,
) -> Result<Task> {
    let job_id = queue.enqueue(name, user_id, args).await?;

    let task: Task = sqlx::query_as(
        r#"
        INSERT INTO tasks (id, name, description, user_id, complete)
        VALUES (?, ?, ?, ?, 0)
        RETURNING id, name, description, user_id, complete
        "#,
    )
    .bind(&job_id)
    .bind(name)
    .bind(description)
    .bind(user_id)
    .fetch_one(conn)
    .await?;

    tracing::info!(task_id = %task.id, user_id, name, "launched task");
    Ok(task)
}

/// Progress percentage of `task`, 0 to 100. Never fails: a job the queue no
/// longer knows, or a queue that cannot be reached, counts as finished.
pub async fn progress(queue: &dyn JobQueue, task: &Task) -> i64 {
    if task.complete {
        return 100;
    }
    match queue.fetch(&task.id).await {
        Ok(Some(job)) => job.progress().unwrap_or(0).clamp(0, 100),
        Ok(None) => {
            tracing::debug!(task_id = %task.id, "job not found in queue; treating as complete");
            100
        }
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "job lookup failed; treating as complete");
            100
        }
    }
}

pub async fn with_progress(queue: &dyn JobQueue, task: Task) -> TaskProgress {
    let progress = progress(queue, &task).await;
    TaskProgress { task, progress }
}

/// The incomplete `name` task of `user_id`, if any.
///
/// Advisory: nothing stops two launches racing past this check.
pub async fn in_progress<'e, E: SqliteExecutor<'e>>(
    executor: E,
    user_id: i64,
    name: &str,
) -> Result<Option<Task>> {
    let task = sqlx::query_as(
        r#"
        SELECT id, name, description, user_id, complete
        FROM tasks
        WHERE user_id = ? AND name = ? AND complete = 0
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(name)
    .fetch_optional(executor)
    .await?;
    Ok(task)
}

/// Every incomplete task of `user_id`.
pub async fn all_in_progress<'e, E: SqliteExecutor<'e>>(
    executor: E,
    user_id: i64,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as(
        r#"
        SELECT id, name, description, user_id, complete
        FROM tasks
        WHERE user_id = ? AND complete = 0
        ORDER BY rowid
        "#,
    )
    .bind(user_id)
    .fetch_all(executor)
    .await?;
    Ok(tasks)
}

pub async fn get<'e, E: SqliteExecutor<'e>>(executor: E, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as(
        "SELECT id, name, description, user_id, complete FROM tasks WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(task)
}

/// Sets the completion flag. Returns `false` if no ledger row has this id.
pub async fn mark_complete(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE tasks SET complete = 1 WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}
