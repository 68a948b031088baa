//! Unit of work: one relational transaction plus the set of entity changes it
//! carries.
//!
//! Write paths record every row they insert, modify, or delete on the
//! [`UnitOfWork`] right after executing the statement. [`UnitOfWork::commit`]
//! then runs the commit lifecycle explicitly:
//!
//! ```text
//! before_commit(changes) ─▶ snapshot ─▶ COMMIT ─┬─ ok  ─▶ after_commit(snapshot)
//!                                               └─ err ─▶ snapshot dropped
//! ```
//!
//! Dropping a unit of work without committing rolls the transaction back and
//! discards its changes; nothing reaches the search index.

use anyhow::Result;
use serde_json::{Map, Value};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::Entity;
use crate::sync::IndexSync;

/// Identity of a tracked row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub table: &'static str,
    pub id: i64,
}

/// A row as captured when it was recorded on the unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub key: EntityKey,
    pub values: Map<String, Value>,
}

impl TrackedEntity {
    pub fn capture<T: Entity>(entity: &T) -> Result<Self> {
        let values = match serde_json::to_value(entity)? {
            Value::Object(map) => map,
            other => anyhow::bail!(
                "{} row did not serialize to an object: {}",
                T::TABLE,
                other
            ),
        };
        Ok(Self {
            key: EntityKey {
                table: T::TABLE,
                id: entity.id(),
            },
            values,
        })
    }
}

/// The added, updated, and deleted rows of one transaction. A key is in at
/// most one of the three sets.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    added: BTreeMap<EntityKey, TrackedEntity>,
    updated: BTreeMap<EntityKey, TrackedEntity>,
    deleted: BTreeMap<EntityKey, TrackedEntity>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_added(&mut self, entity: TrackedEntity) {
        let key = entity.key;
        if self.deleted.remove(&key).is_some() {
            self.updated.insert(key, entity);
        } else {
            self.updated.remove(&key);
            self.added.insert(key, entity);
        }
    }

    pub fn record_updated(&mut self, entity: TrackedEntity) {
        let key = entity.key;
        if let Some(slot) = self.added.get_mut(&key) {
            *slot = entity;
            return;
        }
        self.deleted.remove(&key);
        self.updated.insert(key, entity);
    }

    pub fn record_deleted(&mut self, entity: TrackedEntity) {
        let key = entity.key;
        // Never visible outside this transaction, so nothing to remove.
        if self.added.remove(&key).is_some() {
            return;
        }
        self.updated.remove(&key);
        self.deleted.insert(key, entity);
    }

    pub fn added(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.added.values()
    }

    pub fn updated(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.updated.values()
    }

    pub fn deleted(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.deleted.values()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }
}

pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
    changes: ChangeSet,
    sync: Arc<IndexSync>,
}

impl UnitOfWork {
    pub fn new(tx: Transaction<'static, Sqlite>, sync: Arc<IndexSync>) -> Self {
        Self {
            tx,
            changes: ChangeSet::new(),
            sync,
        }
    }

    /// Connection of the open transaction, for executing statements.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub fn added<T: Entity>(&mut self, entity: &T) -> Result<()> {
        self.changes.record_added(TrackedEntity::capture(entity)?);
        Ok(())
    }

    pub fn updated<T: Entity>(&mut self, entity: &T) -> Result<()> {
        self.changes.record_updated(TrackedEntity::capture(entity)?);
        Ok(())
    }

    pub fn deleted<T: Entity>(&mut self, entity: &T) -> Result<()> {
        self.changes.record_deleted(TrackedEntity::capture(entity)?);
        Ok(())
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Commits the transaction, then replays its searchable changes into the
    /// index. A failed commit returns the error and replays nothing.
    pub async fn commit(self) -> Result<()> {
        let UnitOfWork { tx, changes, sync } = self;
        let snapshot = sync.before_commit(changes);
        tx.commit().await?;
        sync.after_commit(snapshot).await;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
