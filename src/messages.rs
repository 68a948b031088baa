//! Private messages and the recipient's `unread_message_count` notification.

use anyhow::Result;
use sqlx::SqliteConnection;

use crate::db::Database;
use crate::models::{now_millis, Message, User};
use crate::outbox;

pub const UNREAD_MESSAGE_COUNT: &str = "unread_message_count";

/// Messages to `user_id` newer than the user's last read time.
pub async fn unread_count(conn: &mut SqliteConnection, user_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM messages
        WHERE recipient_id = ?
          AND timestamp > COALESCE(
              (SELECT last_message_read_time FROM users WHERE id = ?), 0)
        "#,
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_one(conn)
    .await?;
    Ok(count)
}

/// Stores the message and refreshes the recipient's unread count in one
/// transaction.
pub async fn send(db: &Database, sender_id: i64, recipient_id: i64, body: &str) -> Result<Message> {
    let mut uow = db.begin().await?;
    let message: Message = sqlx::query_as(
        r#"
        INSERT INTO messages (sender_id, recipient_id, body, timestamp)
        VALUES (?, ?, ?, ?)
        RETURNING id, sender_id, recipient_id, body, timestamp
        "#,
    )
    .bind(sender_id)
    .bind(recipient_id)
    .bind(body)
    .bind(now_millis())
    .fetch_one(uow.conn())
    .await?;
    uow.added(&message)?;

    let count = unread_count(uow.conn(), recipient_id).await?;
    outbox::post(uow.conn(), recipient_id, UNREAD_MESSAGE_COUNT, &count).await?;
    uow.commit().await?;

    tracing::debug!(sender_id, recipient_id, unread = count, "message sent");
    Ok(message)
}

/// Marks every message to `user_id` read. `None` if the user does not exist.
pub async fn mark_read(db: &Database, user_id: i64) -> Result<Option<User>> {
    let mut uow = db.begin().await?;
    let user: Option<User> = sqlx::query_as(
        r#"
        UPDATE users SET last_message_read_time = ?
        WHERE id = ?
        RETURNING id, username, email, about_me, last_seen, last_message_read_time
        "#,
    )
    .bind(now_millis())
    .bind(user_id)
    .fetch_optional(uow.conn())
    .await?;

    let Some(user) = user else {
        uow.rollback().await?;
        return Ok(None);
    };
    uow.updated(&user)?;
    outbox::post(uow.conn(), user_id, UNREAD_MESSAGE_COUNT, &0).await?;
    uow.commit().await?;
    Ok(Some(user))
}
