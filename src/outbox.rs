//! Notification Outbox.
//!
//! Per-user named notifications, polled incrementally by timestamp. Posting a
//! name again for the same user replaces the previous row, so the outbox
//! holds the latest value of each named signal (`unread_message_count`,
//! `task_progress`, ...), not a history.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::Notification;

/// A notification as handed to polling clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NotificationView {
    pub name: String,
    pub data: Value,
    pub timestamp: f64,
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Wall-clock seconds, strictly increasing within this process.
pub fn next_timestamp() -> f64 {
    let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
    let mut current = LAST_TIMESTAMP.load(Ordering::SeqCst);
    loop {
        let last = f64::from_bits(current);
        let next = if now > last { now } else { last + 1e-6 };
        match LAST_TIMESTAMP.compare_exchange(
            current,
            next.to_bits(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return next,
            Err(observed) => current = observed,
        }
    }
}

/// Replaces the `(user_id, name)` notification. Runs on the caller's
/// connection so it commits with the caller's other writes.
pub async fn post<P: Serialize + ?Sized>(
    conn: &mut SqliteConnection,
    user_id: i64,
    name: &str,
    payload: &P,
) -> Result<Notification> {
    let payload_json = serde_json::to_string(payload)?;

    sqlx::query("DELETE FROM notifications WHERE user_id = ? AND name = ?")
        .bind(user_id)
        .bind(name)
        .execute(&mut *conn)
        .await?;

    let notification: Notification = sqlx::query_as(
        r#"
        INSERT INTO notifications (name, user_id, timestamp, payload_json)
        VALUES (?, ?, ?, ?)
        RETURNING id, name, user_id, timestamp, payload_json
        "#,
    )
    .bind(name)
    .bind(user_id)
    .bind(next_timestamp())
    .bind(&payload_json)
    .fetch_one(&mut *conn)
    .await?;

    tracing::debug!(user_id, name, "posted notification");
    Ok(notification)
}

/// Notifications of `user_id` newer than `since`, oldest first.
pub async fn poll(pool: &SqlitePool, user_id: i64, since: f64) -> Result<Vec<NotificationView>> {
    let rows: Vec<Notification> = sqlx::query_as(
        r#"
        SELECT id, name, user_id, timestamp, payload_json
        FROM notifications
        WHERE user_id = ? AND timestamp > ?
        ORDER BY timestamp ASC
        "#,
    )
    .bind(user_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|n| {
            Ok(NotificationView {
                data: n.payload()?,
                name: n.name,
                timestamp: n.timestamp,
            })
        })
        .collect()
}
