use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates the relational schema. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Create users table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            about_me TEXT,
            last_seen INTEGER NOT NULL,
            last_message_read_time INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Foreign keys are deferred so integrity failures surface at COMMIT.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            body TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            user_id INTEGER NOT NULL
                REFERENCES users(id) DEFERRABLE INITIALLY DEFERRED,
            language TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id INTEGER NOT NULL
                REFERENCES users(id) DEFERRABLE INITIALLY DEFERRED,
            recipient_id INTEGER NOT NULL
                REFERENCES users(id) DEFERRABLE INITIALLY DEFERRED,
            body TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Task ledger: id is the job id assigned by the queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            user_id INTEGER NOT NULL
                REFERENCES users(id) DEFERRABLE INITIALLY DEFERRED,
            complete INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            user_id INTEGER NOT NULL
                REFERENCES users(id) DEFERRABLE INITIALLY DEFERRED,
            timestamp REAL NOT NULL,
            payload_json TEXT NOT NULL,
            UNIQUE(user_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_timestamp ON posts(timestamp DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_user_id ON posts(user_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id, timestamp)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_user_name ON tasks(user_id, name, complete)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user_ts ON notifications(user_id, timestamp)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
