//! Database connections and the [`Database`] handle.
//!
//! The relational store, the job queue store, and the SQLite search index
//! are separate files; all of them are opened through [`connect_path`].

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::registry::SearchableRegistry;
use crate::search::SearchIndex;
use crate::sync::IndexSync;
use crate::uow::UnitOfWork;

pub async fn connect_path(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_path(&config.db.path).await
}

/// Relational store handle: the connection pool plus the commit hook that
/// every [`UnitOfWork`] begun from it will run.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    sync: Arc<IndexSync>,
}

impl Database {
    pub fn new(pool: SqlitePool, sync: Arc<IndexSync>) -> Self {
        Self { pool, sync }
    }

    /// Connects to the relational store and the configured search backend,
    /// registering the default searchable tables.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = connect(config).await?;
        let index = SearchIndex::connect(&config.search).await?;
        let sync = IndexSync::new(index, SearchableRegistry::with_defaults());
        Ok(Self::new(pool, Arc::new(sync)))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn sync(&self) -> &IndexSync {
        &self.sync
    }

    pub fn index(&self) -> &SearchIndex {
        self.sync.index()
    }

    /// Starts a transaction whose commit replays its changes into the index.
    pub async fn begin(&self) -> Result<UnitOfWork> {
        let tx = self.pool.begin().await?;
        Ok(UnitOfWork::new(tx, self.sync.clone()))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
