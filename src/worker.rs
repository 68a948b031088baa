//! Background worker.
//!
//! Runs in the `mb-worker` process. It claims jobs from the [`JobQueue`],
//! dispatches them to a [`JobHandler`] by function name, and reports progress
//! back through the queue metadata, the task ledger, and the owner's
//! notification outbox.
//!
//! Every job starts at progress 0 and ends at progress 100 whether the
//! handler succeeded or not; the queue records which of the two it was.
//!
//! The ledger row is the record the web process trusts, so completing it
//! does not depend on the queue store. Progress metadata on the queue is
//! best-effort, and a job whose outcome could not be recorded is failed
//! later by the abandoned-job sweep in [`Worker::run`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::export::ExportPostsJob;
use crate::outbox;
use crate::queue::{Job, JobQueue};
use crate::tasks;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_ABANDON_AFTER: Duration = Duration::from_secs(3600);

/// Handle a job body uses to reach the stores and report progress.
pub struct JobContext {
    job: Job,
    pool: SqlitePool,
    queue: Arc<dyn JobQueue>,
}

impl JobContext {
    pub fn new(job: Job, pool: SqlitePool, queue: Arc<dyn JobQueue>) -> Self {
        Self { job, pool, queue }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Publishes `progress` to the queue and to the owner's outbox. At 100
    /// the ledger row is marked complete first, on its own.
    ///
    /// A failed queue write is logged and skipped; only relational failures
    /// are returned.
    pub async fn set_progress(&self, progress: i64) -> Result<()> {
        if let Err(e) = self
            .queue
            .set_meta(&self.job.id, "progress", json!(progress))
            .await
        {
            tracing::warn!(job_id = %self.job.id, progress, error = %e, "could not record progress on the queue");
        }

        if progress >= 100 {
            self.complete_ledger().await?;
        }

        let mut tx = self.pool.begin().await?;
        outbox::post(
            &mut tx,
            self.job.user_id,
            "task_progress",
            &json!({ "task_id": self.job.id, "progress": progress }),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete_ledger(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if !tasks::mark_complete(&mut conn, &self.job.id).await? {
            tracing::warn!(job_id = %self.job.id, "no ledger row for finished job");
        }
        Ok(())
    }
}

/// A job body, selected by the function name the job was enqueued with.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &JobContext) -> Result<()>;
}

#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every job the application launches.
    pub fn with_builtins(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExportPostsJob::new(config.worker.export_dir.clone())));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

pub struct Worker {
    pool: SqlitePool,
    queue: Arc<dyn JobQueue>,
    registry: JobRegistry,
    poll_interval: Duration,
    abandon_after: Duration,
}

impl Worker {
    pub fn new(
        pool: SqlitePool,
        queue: Arc<dyn JobQueue>,
        registry: JobRegistry,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            registry,
            poll_interval,
            abandon_after: DEFAULT_ABANDON_AFTER,
        }
    }

    /// How long a job may stay `started` before the sweep fails it.
    pub fn with_abandon_after(mut self, abandon_after: Duration) -> Self {
        self.abandon_after = abandon_after;
        self
    }

    /// Claims and executes at most one job. Returns its id.
    pub async fn run_once(&self) -> Result<Option<String>> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        let id = job.id.clone();
        self.execute(job).await?;
        Ok(Some(id))
    }

    /// Runs jobs until the queue is empty. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut count = 0;
        while self.run_once().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Polls the queue until ctrl-c. A job in flight finishes first.
    pub async fn run(&self) -> Result<()> {
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    let _ = stop_tx.send(true);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot listen for ctrl-c; stop the worker externally");
                    // Keep the sender alive so the poll loop still sleeps.
                    std::future::pending::<()>().await;
                }
            }
        });

        tracing::info!(jobs = ?self.registry.names(), "worker started");
        let mut last_purge: Option<Instant> = None;
        loop {
            if *stop_rx.borrow() {
                break;
            }

            if last_purge.map_or(true, |t| t.elapsed() >= PURGE_INTERVAL) {
                if let Err(e) = self.queue.fail_abandoned(self.abandon_after).await {
                    tracing::warn!(error = %e, "failing abandoned jobs failed");
                }
                match self.queue.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(purged = n, "purged expired jobs"),
                    Err(e) => tracing::warn!(error = %e, "purging expired jobs failed"),
                }
                last_purge = Some(Instant::now());
            }

            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "worker iteration failed"),
            }

            tokio::select! {
                _ = stop_rx.changed() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("worker stopped");
        Ok(())
    }

    async fn execute(&self, job: Job) -> Result<()> {
        let id = job.id.clone();
        let function = job.function.clone();
        tracing::info!(job_id = %id, function = %function, user_id = job.user_id, "job started");

        let ctx = JobContext::new(job, self.pool.clone(), self.queue.clone());
        if let Err(e) = ctx.set_progress(0).await {
            tracing::warn!(job_id = %id, error = %e, "could not report start");
        }

        let outcome = match self.registry.get(&function) {
            Some(handler) => handler.run(&ctx).await,
            None => Err(anyhow::anyhow!("no handler registered for job function '{}'", function)),
        };

        let error = match &outcome {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(job_id = %id, function = %function, error = %e, "job failed");
                Some(format!("{:#}", e))
            }
        };

        if let Err(e) = ctx.set_progress(100).await {
            tracing::warn!(job_id = %id, error = %e, "could not report completion");
        }

        if let Err(e) = self.queue.finish(&id, error.as_deref()).await {
            tracing::warn!(job_id = %id, error = %e, "recording job outcome failed; retrying once");
            self.queue.finish(&id, error.as_deref()).await.map_err(|e| {
                tracing::error!(job_id = %id, error = %e, "job outcome not recorded; left for the abandoned-job sweep");
                e
            })?;
        }

        tracing::info!(job_id = %id, failed = error.is_some(), "job ended");
        Ok(())
    }
}
