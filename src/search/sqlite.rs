//! SQLite FTS5 [`SearchBackend`].
//!
//! Keeps every collection in one FTS5 table inside its own database file,
//! separate from the relational store so an index rebuild never touches
//! application data. Ranking is FTS5's built-in BM25 `rank`.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use super::{document_text, SearchBackend, SearchHits};
use crate::db;

pub struct SqliteFtsBackend {
    pool: SqlitePool,
}

impl SqliteFtsBackend {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        Self::from_pool(pool).await
    }

    /// Uses an existing pool, creating the FTS5 table if it is missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='search_documents'",
        )
        .fetch_one(&pool)
        .await?;

        if !fts_exists {
            sqlx::query(
                r#"
                CREATE VIRTUAL TABLE search_documents USING fts5(
                    collection UNINDEXED,
                    doc_id UNINDEXED,
                    body
                )
                "#,
            )
            .execute(&pool)
            .await?;
        }

        Ok(Self { pool })
    }
}

#[async_trait]
impl SearchBackend for SqliteFtsBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn index(&self, collection: &str, id: i64, document: &Map<String, Value>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM search_documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO search_documents (collection, doc_id, body) VALUES (?, ?, ?)")
            .bind(collection)
            .bind(id)
            .bind(document_text(document))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, collection: &str, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM search_documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        offset: i64,
        limit: i64,
    ) -> Result<SearchHits> {
        let Some(expr) = match_expression(text) else {
            return Ok(SearchHits::empty());
        };

        let rows = sqlx::query(
            r#"
            SELECT CAST(doc_id AS INTEGER) AS doc_id
            FROM search_documents
            WHERE search_documents MATCH ? AND collection = ?
            ORDER BY rank, CAST(doc_id AS INTEGER)
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(&expr)
        .bind(collection)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM search_documents WHERE search_documents MATCH ? AND collection = ?",
        )
        .bind(&expr)
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;

        let ids = rows.iter().map(|row| row.get::<i64, _>("doc_id")).collect();
        Ok(SearchHits { ids, total })
    }
}

/// Turns free text into an FTS5 expression: each whitespace-separated term
/// becomes a quoted phrase, OR-ed together, so user input never reaches the
/// FTS5 query parser as syntax.
fn match_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(body: &str) -> Map<String, Value> {
        json!({ "body": body }).as_object().unwrap().clone()
    }

    #[test]
    fn match_expression_quotes_terms() {
        assert_eq!(match_expression("  "), None);
        assert_eq!(
            match_expression("rust AND \"async\""),
            Some("\"rust\" OR \"AND\" OR \"\"\"async\"\"\"".to_string())
        );
    }

    #[tokio::test]
    async fn index_query_remove() {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteFtsBackend::open(&tmp.path().join("search.sqlite"))
            .await
            .unwrap();

        backend.index("posts", 1, &doc("learning rust today")).await.unwrap();
        backend.index("posts", 2, &doc("python notes")).await.unwrap();
        backend.index("posts", 3, &doc("rust and more rust")).await.unwrap();

        let hits = backend.query("posts", "rust", 0, 10).await.unwrap();
        assert_eq!(hits.total, 2);
        assert_eq!(hits.ids.len(), 2);
        assert!(hits.ids.contains(&1) && hits.ids.contains(&3));

        // Re-indexing replaces the document rather than duplicating it
        backend.index("posts", 1, &doc("now about go")).await.unwrap();
        let hits = backend.query("posts", "rust", 0, 10).await.unwrap();
        assert_eq!(hits.ids, vec![3]);

        backend.remove("posts", 3).await.unwrap();
        backend.remove("posts", 3).await.unwrap();
        let hits = backend.query("posts", "rust", 0, 10).await.unwrap();
        assert_eq!(hits.total, 0);
    }

    #[tokio::test]
    async fn reopen_keeps_existing_table() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("search.sqlite");
        {
            let backend = SqliteFtsBackend::open(&path).await.unwrap();
            backend.index("posts", 9, &doc("persisted")).await.unwrap();
        }
        let backend = SqliteFtsBackend::open(&path).await.unwrap();
        let hits = backend.query("posts", "persisted", 0, 10).await.unwrap();
        assert_eq!(hits.ids, vec![9]);
    }

    #[tokio::test]
    async fn offset_and_limit_page_results() {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteFtsBackend::open(&tmp.path().join("search.sqlite"))
            .await
            .unwrap();
        for id in 1..=4 {
            backend.index("posts", id, &doc("same words")).await.unwrap();
        }
        let page = backend.query("posts", "words", 2, 2).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.ids.len(), 2);
    }
}
