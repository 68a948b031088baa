//! Search Index Adapter.
//!
//! [`SearchIndex`] is the only entry point the rest of the crate uses to talk
//! to a full-text search service. It wraps an optional [`SearchBackend`] and
//! enforces the best-effort contract:
//!
//! | Operation | Backend unconfigured | Backend error / timeout |
//! |-----------|----------------------|-------------------------|
//! | [`index`](SearchIndex::index) | no-op | logged, swallowed |
//! | [`remove`](SearchIndex::remove) | no-op | logged, swallowed |
//! | [`query`](SearchIndex::query) | `([], 0)` | [`SearchError::Unavailable`] |
//!
//! Documents are keyed by `(collection, id)` where the collection is the
//! table name and the id is the row's primary key.
//!
//! # Backends
//!
//! - [`elasticsearch::ElasticsearchBackend`]: REST API via `reqwest`.
//! - [`sqlite::SqliteFtsBackend`]: FTS5 table in a separate SQLite file.
//! - [`memory::InMemoryBackend`]: in-process, for tests and local runs.

pub mod elasticsearch;
pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SearchConfig;
use crate::error::SearchError;

/// Ranked ids for one page of a query, plus the total match count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHits {
    pub ids: Vec<i64>,
    pub total: i64,
}

impl SearchHits {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// A full-text search service.
///
/// Implementations report every failure as an error; the best-effort policy
/// lives in [`SearchIndex`], not here.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Short backend name for logs (e.g. `"elasticsearch"`).
    fn name(&self) -> &str;

    /// Insert or overwrite the document `id` in `collection`.
    async fn index(&self, collection: &str, id: i64, document: &Map<String, Value>) -> Result<()>;

    /// Delete the document `id` from `collection`. Absence is not an error.
    async fn remove(&self, collection: &str, id: i64) -> Result<()>;

    /// Rank documents of `collection` against `text`.
    async fn query(&self, collection: &str, text: &str, offset: i64, limit: i64)
        -> Result<SearchHits>;
}

/// Best-effort adapter over an optional [`SearchBackend`].
#[derive(Clone)]
pub struct SearchIndex {
    backend: Option<Arc<dyn SearchBackend>>,
    timeout: Duration,
}

impl SearchIndex {
    pub fn new(backend: Arc<dyn SearchBackend>, timeout: Duration) -> Self {
        Self {
            backend: Some(backend),
            timeout,
        }
    }

    /// An adapter with no backend: writes are no-ops, queries return nothing.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Builds the adapter for the configured backend.
    pub async fn connect(config: &SearchConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let backend: Arc<dyn SearchBackend> = match config.backend.as_str() {
            "disabled" => return Ok(Self::disabled()),
            "elasticsearch" => Arc::new(elasticsearch::ElasticsearchBackend::new(config)?),
            "sqlite" => {
                let path = config
                    .path
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("search.path required for sqlite backend"))?;
                Arc::new(sqlite::SqliteFtsBackend::open(path).await?)
            }
            "memory" => Arc::new(memory::InMemoryBackend::new()),
            other => anyhow::bail!("Unknown search backend: {}", other),
        };
        Ok(Self::new(backend, timeout))
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.as_ref().map_or("disabled", |b| b.name())
    }

    /// Upserts a document. Never fails the caller.
    pub async fn index(&self, collection: &str, id: i64, document: &Map<String, Value>) {
        let Some(backend) = &self.backend else {
            return;
        };
        match tokio::time::timeout(self.timeout, backend.index(collection, id, document)).await {
            Ok(Ok(())) => tracing::debug!(collection, id, "indexed document"),
            Ok(Err(e)) => {
                tracing::warn!(collection, id, error = %e, "index failed; repair with reindex")
            }
            Err(_) => tracing::warn!(
                collection,
                id,
                timeout_ms = self.timeout.as_millis() as u64,
                "index timed out; repair with reindex"
            ),
        }
    }

    /// Deletes a document. Never fails the caller.
    pub async fn remove(&self, collection: &str, id: i64) {
        let Some(backend) = &self.backend else {
            return;
        };
        match tokio::time::timeout(self.timeout, backend.remove(collection, id)).await {
            Ok(Ok(())) => tracing::debug!(collection, id, "removed document"),
            Ok(Err(e)) => {
                tracing::warn!(collection, id, error = %e, "remove failed; repair with reindex")
            }
            Err(_) => tracing::warn!(
                collection,
                id,
                timeout_ms = self.timeout.as_millis() as u64,
                "remove timed out; repair with reindex"
            ),
        }
    }

    /// Returns one page of ranked ids. Pages are 1-indexed; a page whose
    /// offset does not fit in an `i64` is [`SearchError::PageOutOfRange`].
    pub async fn query(
        &self,
        collection: &str,
        text: &str,
        page: i64,
        page_size: i64,
    ) -> Result<SearchHits, SearchError> {
        let Some(backend) = &self.backend else {
            return Ok(SearchHits::empty());
        };
        if text.trim().is_empty() || page_size < 1 {
            return Ok(SearchHits::empty());
        }

        let offset = (page.max(1) - 1)
            .checked_mul(page_size)
            .filter(|offset| offset.checked_add(page_size).is_some())
            .ok_or(SearchError::PageOutOfRange(page))?;
        match tokio::time::timeout(
            self.timeout,
            backend.query(collection, text, offset, page_size),
        )
        .await
        {
            Ok(Ok(hits)) => Ok(hits),
            Ok(Err(e)) => {
                tracing::warn!(collection, error = %e, "search query failed");
                Err(SearchError::Unavailable(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(collection, "search query timed out");
                Err(SearchError::Unavailable(format!(
                    "{} did not answer within {}ms",
                    backend.name(),
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

/// Joins the string form of every field value, for backends that index a
/// single text column.
pub(crate) fn document_text(document: &Map<String, Value>) -> String {
    document
        .values()
        .filter_map(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
