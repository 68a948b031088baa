//! Database statistics and health overview.
//!
//! Summarizes what the relational store holds, how many background tasks are
//! still open, and which search backend the index lives in. Used by
//! `mb stats` to check a deployment at a glance.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::queue::SqliteJobQueue;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub users: i64,
    pub posts: i64,
    pub messages: i64,
    pub tasks: i64,
    pub tasks_open: i64,
    pub notifications: i64,
}

pub async fn collect(pool: &SqlitePool) -> Result<StoreStats> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM users) AS users,
            (SELECT COUNT(*) FROM posts) AS posts,
            (SELECT COUNT(*) FROM messages) AS messages,
            (SELECT COUNT(*) FROM tasks) AS tasks,
            (SELECT COUNT(*) FROM tasks WHERE complete = 0) AS tasks_open,
            (SELECT COUNT(*) FROM notifications) AS notifications
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(StoreStats {
        users: row.get("users"),
        posts: row.get("posts"),
        messages: row.get("messages"),
        tasks: row.get("tasks"),
        tasks_open: row.get("tasks_open"),
        notifications: row.get("notifications"),
    })
}

/// Job counts per status in the queue store.
async fn queue_counts(queue: &SqliteJobQueue) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM jobs WHERE queue = ? GROUP BY status ORDER BY status",
    )
    .bind(queue.name())
    .fetch_all(queue.pool())
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
        .collect())
}

/// Run the stats command: query the stores and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Microblog — Store Stats");
    println!("=======================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!("  Search:        {}", config.search.backend);
    println!();
    println!("  Users:         {}", stats.users);
    println!("  Posts:         {}", stats.posts);
    println!("  Messages:      {}", stats.messages);
    println!("  Notifications: {}", stats.notifications);
    println!(
        "  Tasks:         {} ({} in progress)",
        stats.tasks, stats.tasks_open
    );

    match SqliteJobQueue::open(&config.queue).await {
        Ok(queue) => {
            let counts = queue_counts(&queue).await?;
            println!();
            println!("  Queue '{}':", queue.name());
            if counts.is_empty() {
                println!("    (empty)");
            }
            for (status, n) in counts {
                println!("    {:<10} {:>6}", status, n);
            }
            queue.close().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "queue store unavailable");
            println!();
            println!("  Queue:         unavailable ({})", e);
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
