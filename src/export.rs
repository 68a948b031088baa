//! The `export_posts` job.
//!
//! Serializes every post of the job's owner to
//! `{export_dir}/posts-{user_id}-{job_id}.json`:
//!
//! ```json
//! { "posts": [ { "body": "...", "timestamp": "2024-01-31T09:15:02Z" } ] }
//! ```
//!
//! Progress is reported per post and stops short of 100; the worker reports
//! 100 once the handler returns, so a finished ledger row always means the
//! file is on disk.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::Row;
use std::path::{Path, PathBuf};

use crate::worker::{JobContext, JobHandler};

pub const EXPORT_POSTS: &str = "export_posts";

#[derive(Serialize)]
struct ExportData {
    posts: Vec<ExportPost>,
}

#[derive(Serialize)]
struct ExportPost {
    body: String,
    timestamp: String,
}

pub struct ExportPostsJob {
    export_dir: PathBuf,
}

impl ExportPostsJob {
    pub fn new(export_dir: PathBuf) -> Self {
        Self { export_dir }
    }
}

/// Where the export of `job_id` for `user_id` lands.
pub fn export_path(export_dir: &Path, user_id: i64, job_id: &str) -> PathBuf {
    export_dir.join(format!("posts-{}-{}.json", user_id, job_id))
}

fn format_iso(ts_millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts_millis.to_string())
}

#[async_trait]
impl JobHandler for ExportPostsJob {
    fn name(&self) -> &str {
        EXPORT_POSTS
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let user_id = ctx.job().user_id;

        let rows = sqlx::query(
            "SELECT body, timestamp FROM posts WHERE user_id = ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(ctx.pool())
        .await?;

        let total = rows.len() as i64;
        let mut posts = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            posts.push(ExportPost {
                body: row.get("body"),
                timestamp: format_iso(row.get("timestamp")),
            });
            let done = (i as i64 + 1) * 100 / total;
            ctx.set_progress(done.min(99)).await?;
        }

        std::fs::create_dir_all(&self.export_dir).with_context(|| {
            format!("Failed to create export dir: {}", self.export_dir.display())
        })?;
        let path = export_path(&self.export_dir, user_id, &ctx.job().id);
        let json = serde_json::to_string_pretty(&ExportData { posts })?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write export: {}", path.display()))?;

        tracing::info!(user_id, posts = total, path = %path.display(), "exported posts");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_path_names_user_and_job() {
        let path = export_path(Path::new("/tmp/exports"), 7, "abc");
        assert_eq!(path, PathBuf::from("/tmp/exports/posts-7-abc.json"));
    }

    #[test]
    fn iso_timestamps_are_utc_seconds() {
        assert_eq!(format_iso(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_iso(1_706_692_502_999), "2024-01-31T09:15:02Z");
    }
}
