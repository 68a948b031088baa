//! Row types for the relational store.
//!
//! Rows that flow through a [`UnitOfWork`](crate::uow::UnitOfWork) implement
//! [`Entity`], which is all the change tracker needs to capture them.
//!
//! Integer timestamps are Unix milliseconds. Notification timestamps are
//! float seconds (see [`outbox`](crate::outbox)).

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

/// Current time in the unit of the integer timestamp columns.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A relational row the unit of work can track.
///
/// The captured state of a tracked row is its `serde` serialization at the
/// moment it is recorded, so field names in the searchable registry are the
/// serialized field names.
pub trait Entity: Serialize {
    /// Table name; also the search collection name.
    const TABLE: &'static str;

    /// Primary key. Must already be assigned when the row is tracked.
    fn id(&self) -> i64;
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub about_me: Option<String>,
    pub last_seen: i64,
    pub last_message_read_time: Option<i64>,
}

impl Entity for User {
    const TABLE: &'static str = "users";

    fn id(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub body: String,
    pub timestamp: i64,
    pub user_id: i64,
    pub language: Option<String>,
}

impl Entity for Post {
    const TABLE: &'static str = "posts";

    fn id(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub body: String,
    pub timestamp: i64,
}

impl Entity for Message {
    const TABLE: &'static str = "messages";

    fn id(&self) -> i64 {
        self.id
    }
}

/// Task ledger entry. `id` is the job id handed out by the queue.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub user_id: i64,
    pub complete: bool,
}

/// Outbox row. At most one exists per `(user_id, name)`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    pub timestamp: f64,
    pub payload_json: String,
}

impl Notification {
    pub fn payload(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.payload_json)?)
    }
}
