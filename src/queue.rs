//! External job queue.
//!
//! The web process enqueues jobs and reads their metadata; the worker process
//! claims, runs, and finishes them. The two only meet in the queue store,
//! which is a separate SQLite file from the relational store.
//!
//! Finished and failed jobs expire `result_ttl` after they end. An expired
//! job is invisible to [`JobQueue::fetch`], exactly as if the queue had
//! evicted it, and is physically removed by [`JobQueue::purge_expired`].
//!
//! A job whose worker died, or could not record the outcome, stays `started`.
//! [`JobQueue::fail_abandoned`] turns such jobs into failed ones so they
//! expire like any other.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "queued" => JobStatus::Queued,
            "started" => JobStatus::Started,
            "finished" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            other => bail!("Unknown job status in queue store: {}", other),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub function: String,
    pub user_id: i64,
    pub args: Value,
    pub status: JobStatus,
    pub meta: Map<String, Value>,
    pub enqueued_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub error: Option<String>,
}

impl Job {
    /// Worker-reported progress percentage, if any has been reported.
    pub fn progress(&self) -> Option<i64> {
        let value = self.meta.get("progress")?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f.round() as i64))
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    function: String,
    user_id: i64,
    args_json: String,
    status: String,
    meta_json: String,
    enqueued_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    error: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let meta = match serde_json::from_str(&row.meta_json)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Job {
            id: row.id,
            function: row.function,
            user_id: row.user_id,
            args: serde_json::from_str(&row.args_json)?,
            status: JobStatus::parse(&row.status)?,
            meta,
            enqueued_at: row.enqueued_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            error: row.error,
        })
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queues `function` for `user_id` and returns the new job id.
    async fn enqueue(&self, function: &str, user_id: i64, args: Value) -> Result<String>;

    /// Live metadata for a job. `None` if unknown or expired.
    async fn fetch(&self, id: &str) -> Result<Option<Job>>;

    /// Sets one key of the job's free-form metadata.
    async fn set_meta(&self, id: &str, key: &str, value: Value) -> Result<()>;

    /// Atomically moves the oldest queued job to `started` and returns it.
    async fn claim_next(&self) -> Result<Option<Job>>;

    /// Records the outcome of a started job. `error` marks it failed.
    async fn finish(&self, id: &str, error: Option<&str>) -> Result<()>;

    /// Deletes expired jobs. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64>;

    /// Fails jobs that have been `started` for at least `older_than`.
    /// Returns the number failed.
    async fn fail_abandoned(&self, older_than: Duration) -> Result<u64>;
}

/// Error recorded on jobs failed by [`JobQueue::fail_abandoned`].
pub const ABANDONED_ERROR: &str = "abandoned: no outcome recorded by the worker";

const JOB_COLUMNS: &str = "id, function, user_id, args_json, status, meta_json, \
                           enqueued_at, started_at, ended_at, error";

pub struct SqliteJobQueue {
    pool: SqlitePool,
    name: String,
    result_ttl_secs: i64,
}

impl SqliteJobQueue {
    pub async fn open(config: &QueueConfig) -> Result<Self> {
        let pool = db::connect_path(&config.path).await?;
        Self::from_pool(pool, &config.name, config.result_ttl_secs as i64).await
    }

    pub async fn from_pool(pool: SqlitePool, name: &str, result_ttl_secs: i64) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                function TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                args_json TEXT NOT NULL,
                status TEXT NOT NULL,
                meta_json TEXT NOT NULL DEFAULT '{}',
                enqueued_at INTEGER NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                error TEXT,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_queue_status ON jobs(queue, status, seq)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            name: name.to_string(),
            result_ttl_secs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, function: &str, user_id: i64, args: Value) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, function, user_id, args_json, status, enqueued_at)
            VALUES (?, ?, ?, ?, ?, 'queued', ?)
            "#,
        )
        .bind(&id)
        .bind(&self.name)
        .bind(function)
        .bind(user_id)
        .bind(serde_json::to_string(&args)?)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id = %id, function, user_id, queue = %self.name, "enqueued job");
        Ok(id)
    }

    async fn fetch(&self, id: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE id = ? AND (expires_at IS NULL OR expires_at > ?)",
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(now_secs())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn set_meta(&self, id: &str, key: &str, value: Value) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET meta_json = json_set(meta_json, ?, json(?)) WHERE id = ?",
        )
        .bind(format!("$.{}", key))
        .bind(serde_json::to_string(&value)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("Job not found: {}", id);
        }
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs SET status = 'started', started_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ? AND status = 'queued'
                ORDER BY seq
                LIMIT 1
            ) AND status = 'queued'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now_secs())
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn finish(&self, id: &str, error: Option<&str>) -> Result<()> {
        let status = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Finished
        };
        let ended_at = now_secs();
        sqlx::query(
            r#"
            UPDATE jobs SET status = ?, ended_at = ?, error = ?, expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(ended_at)
        .bind(error)
        .bind(ended_at + self.result_ttl_secs)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now_secs())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fail_abandoned(&self, older_than: Duration) -> Result<u64> {
        let now = now_secs();
        let cutoff = now.saturating_sub(i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX));
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'failed', ended_at = ?, error = ?, expires_at = ?
            WHERE queue = ? AND status = 'started' AND started_at <= ?
            "#,
        )
        .bind(now)
        .bind(ABANDONED_ERROR)
        .bind(now + self.result_ttl_secs)
        .bind(&self.name)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let failed = result.rows_affected();
        if failed > 0 {
            tracing::warn!(failed, queue = %self.name, "failed abandoned jobs");
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_queue(tmp: &TempDir, ttl: i64) -> SqliteJobQueue {
        let pool = db::connect_path(&tmp.path().join("queue.sqlite")).await.unwrap();
        SqliteJobQueue::from_pool(pool, "test", ttl).await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_claim_finish() {
        let tmp = TempDir::new().unwrap();
        let queue = open_queue(&tmp, 500).await;

        let first = queue.enqueue("export_posts", 1, json!([])).await.unwrap();
        let second = queue.enqueue("export_posts", 2, json!(["x"])).await.unwrap();
        assert_ne!(first, second);

        let job = queue.fetch(&first).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress(), None);

        // FIFO
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Started);

        queue.finish(&first, None).await.unwrap();
        let done = queue.fetch(&first).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Finished);
        assert!(done.ended_at.is_some());

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, second);
        assert_eq!(claimed.args, json!(["x"]));
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn meta_progress_is_merged() {
        let tmp = TempDir::new().unwrap();
        let queue = open_queue(&tmp, 500).await;
        let id = queue.enqueue("export_posts", 1, json!([])).await.unwrap();

        queue.set_meta(&id, "progress", json!(40)).await.unwrap();
        queue.set_meta(&id, "note", json!("halfway")).await.unwrap();

        let job = queue.fetch(&id).await.unwrap().unwrap();
        assert_eq!(job.progress(), Some(40));
        assert_eq!(job.meta["note"], json!("halfway"));
        assert!(queue.set_meta("missing", "progress", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn expired_jobs_are_invisible_and_purged() {
        let tmp = TempDir::new().unwrap();
        let queue = open_queue(&tmp, 0).await;
        let id = queue.enqueue("export_posts", 1, json!([])).await.unwrap();
        queue.claim_next().await.unwrap();
        queue.finish(&id, Some("boom")).await.unwrap();

        assert!(queue.fetch(&id).await.unwrap().is_none());
        assert_eq!(queue.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn abandoned_started_jobs_are_failed() {
        let tmp = TempDir::new().unwrap();
        let queue = open_queue(&tmp, 500).await;
        let started = queue.enqueue("export_posts", 1, json!([])).await.unwrap();
        let waiting = queue.enqueue("export_posts", 2, json!([])).await.unwrap();
        queue.claim_next().await.unwrap();

        // Claimed just now, so not yet abandoned
        assert_eq!(queue.fail_abandoned(Duration::from_secs(3600)).await.unwrap(), 0);

        assert_eq!(queue.fail_abandoned(Duration::ZERO).await.unwrap(), 1);
        let job = queue.fetch(&started).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(ABANDONED_ERROR));
        assert!(job.ended_at.is_some());

        let job = queue.fetch(&waiting).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn abandoned_jobs_expire_like_failed_ones() {
        let tmp = TempDir::new().unwrap();
        let queue = open_queue(&tmp, 0).await;
        queue.enqueue("export_posts", 1, json!([])).await.unwrap();
        queue.claim_next().await.unwrap();

        // Never finished: nothing to purge until the sweep fails it
        assert_eq!(queue.purge_expired().await.unwrap(), 0);
        assert_eq!(queue.fail_abandoned(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queues_are_isolated_by_name() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("queue.sqlite")).await.unwrap();
        let a = SqliteJobQueue::from_pool(pool.clone(), "a", 500).await.unwrap();
        let b = SqliteJobQueue::from_pool(pool, "b", 500).await.unwrap();

        a.enqueue("export_posts", 1, json!([])).await.unwrap();
        assert!(b.claim_next().await.unwrap().is_none());
        assert!(a.claim_next().await.unwrap().is_some());
    }
}
