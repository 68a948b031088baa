//! Change-Tracking Hook.
//!
//! [`IndexSync`] is the bridge between a [`UnitOfWork`](crate::uow::UnitOfWork)
//! commit and the [`SearchIndex`]. It is consulted twice per commit:
//!
//! 1. [`before_commit`](IndexSync::before_commit) turns the change set into a
//!    [`SyncSnapshot`] holding only rows of registered tables, projected onto
//!    their searchable fields.
//! 2. [`after_commit`](IndexSync::after_commit) replays the snapshot, and is
//!    only reached once the transaction is durable.
//!
//! [`reindex`](IndexSync::reindex) rebuilds a table's documents from the
//! relational store. Upserts are idempotent, so it can run next to live
//! traffic.

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, SqlitePool};

use crate::models::{Entity, Post};
use crate::progress::{ReindexEvent, ReindexReporter};
use crate::registry::SearchableRegistry;
use crate::search::SearchIndex;
use crate::uow::ChangeSet;

const REINDEX_BATCH: i64 = 500;

/// Index mutations captured from one transaction, waiting for its commit.
#[derive(Debug, Default)]
pub struct SyncSnapshot {
    pub upserts: Vec<(&'static str, i64, Map<String, Value>)>,
    pub removals: Vec<(&'static str, i64)>,
}

impl SyncSnapshot {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

pub struct IndexSync {
    index: SearchIndex,
    registry: SearchableRegistry,
}

impl IndexSync {
    pub fn new(index: SearchIndex, registry: SearchableRegistry) -> Self {
        Self { index, registry }
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn registry(&self) -> &SearchableRegistry {
        &self.registry
    }

    pub fn before_commit(&self, changes: ChangeSet) -> SyncSnapshot {
        let mut snapshot = SyncSnapshot::default();
        for entity in changes.added().chain(changes.updated()) {
            if let Some(document) = self.registry.project(entity.key.table, &entity.values) {
                snapshot
                    .upserts
                    .push((entity.key.table, entity.key.id, document));
            }
        }
        for entity in changes.deleted() {
            if self.registry.is_searchable(entity.key.table) {
                snapshot.removals.push((entity.key.table, entity.key.id));
            }
        }
        snapshot
    }

    pub async fn after_commit(&self, snapshot: SyncSnapshot) {
        if snapshot.is_empty() {
            return;
        }
        tracing::debug!(
            upserts = snapshot.upserts.len(),
            removals = snapshot.removals.len(),
            "replaying committed changes into search index"
        );
        for (table, id, document) in &snapshot.upserts {
            self.index.index(table, *id, document).await;
        }
        for (table, id) in &snapshot.removals {
            self.index.remove(table, *id).await;
        }
    }

    /// Re-adds every row of `T` to the index. Returns the number of rows sent.
    pub async fn reindex<T>(&self, pool: &SqlitePool, reporter: &dyn ReindexReporter) -> Result<u64>
    where
        T: Entity + for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let table = T::TABLE;
        if !self.registry.is_searchable(table) {
            bail!("Table '{}' is not registered as searchable", table);
        }

        reporter.report(ReindexEvent::Counting {
            table: table.to_string(),
        });
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await?;

        let select = format!("SELECT * FROM {} WHERE id > ? ORDER BY id LIMIT ?", table);
        let mut last_id = 0i64;
        let mut indexed = 0u64;
        loop {
            let rows: Vec<T> = sqlx::query_as(&select)
                .bind(last_id)
                .bind(REINDEX_BATCH)
                .fetch_all(pool)
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            last_id = last.id();

            for row in &rows {
                let values = match serde_json::to_value(row)? {
                    Value::Object(map) => map,
                    _ => bail!("{} row did not serialize to an object", table),
                };
                if let Some(document) = self.registry.project(table, &values) {
                    self.index.index(table, row.id(), &document).await;
                    indexed += 1;
                }
            }

            reporter.report(ReindexEvent::Indexing {
                table: table.to_string(),
                n: indexed,
                total: total.max(indexed as i64) as u64,
            });
        }

        reporter.report(ReindexEvent::Done {
            table: table.to_string(),
            indexed,
        });
        tracing::info!(table, indexed, "reindex complete");
        Ok(indexed)
    }

    /// Reindexes a table chosen by name.
    pub async fn reindex_table(
        &self,
        pool: &SqlitePool,
        table: &str,
        reporter: &dyn ReindexReporter,
    ) -> Result<u64> {
        match table {
            t if t == Post::TABLE => self.reindex::<Post>(pool, reporter).await,
            other => bail!("No searchable row type for table '{}'", other),
        }
    }
}
