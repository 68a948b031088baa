//! In-memory [`SearchBackend`] for tests and local development.
//!
//! Relevance is the number of query-term occurrences across the document's
//! string fields; ties are broken by ascending id so results are stable.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{document_text, SearchBackend, SearchHits};

pub struct InMemoryBackend {
    collections: RwLock<HashMap<String, BTreeMap<i64, Map<String, Value>>>>,
    available: AtomicBool,
    mutations: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            mutations: AtomicUsize::new(0),
        }
    }

    /// Simulates an outage: every call fails while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `index`/`remove` calls received, including failed ones.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Ids currently indexed in `collection`, ascending.
    pub fn ids(&self, collection: &str) -> Vec<i64> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        collections
            .get(collection)
            .map(|docs| docs.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn document(&self, collection: &str, id: i64) -> Option<Map<String, Value>> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        collections.get(collection).and_then(|docs| docs.get(&id).cloned())
    }

    fn check_available(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            bail!("connection refused: in-memory search backend is offline");
        }
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn index(&self, collection: &str, id: i64, document: &Map<String, Value>) -> Result<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, document.clone());
        Ok(())
    }

    async fn remove(&self, collection: &str, id: i64) -> Result<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(docs) = collections.get_mut(collection) {
            docs.remove(&id);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        offset: i64,
        limit: i64,
    ) -> Result<SearchHits> {
        self.check_available()?;

        let query_lower = text.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(SearchHits::empty());
        }

        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        let Some(docs) = collections.get(collection) else {
            return Ok(SearchHits::empty());
        };

        let mut scored: Vec<(i64, usize)> = docs
            .iter()
            .filter_map(|(id, doc)| {
                let text_lower = document_text(doc).to_lowercase();
                let score: usize = terms.iter().map(|t| text_lower.matches(t).count()).sum();
                (score > 0).then_some((*id, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let total = scored.len() as i64;
        let ids = scored
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|(id, _)| id)
            .collect();

        Ok(SearchHits { ids, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(body: &str) -> Map<String, Value> {
        json!({ "body": body }).as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn ranks_by_term_occurrences() {
        let backend = InMemoryBackend::new();
        backend.index("posts", 1, &doc("rust once")).await.unwrap();
        backend.index("posts", 2, &doc("rust rust rust")).await.unwrap();
        backend.index("posts", 3, &doc("python")).await.unwrap();

        let hits = backend.query("posts", "Rust", 0, 10).await.unwrap();
        assert_eq!(hits.ids, vec![2, 1]);
        assert_eq!(hits.total, 2);
    }

    #[tokio::test]
    async fn reindex_overwrites_and_remove_is_idempotent() {
        let backend = InMemoryBackend::new();
        backend.index("posts", 1, &doc("old")).await.unwrap();
        backend.index("posts", 1, &doc("new")).await.unwrap();
        assert_eq!(backend.ids("posts"), vec![1]);
        assert_eq!(backend.document("posts", 1).unwrap()["body"], json!("new"));

        backend.remove("posts", 1).await.unwrap();
        backend.remove("posts", 1).await.unwrap();
        assert!(backend.ids("posts").is_empty());
        assert_eq!(backend.mutation_count(), 4);
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let backend = InMemoryBackend::new();
        backend.index("posts", 1, &doc("shared word")).await.unwrap();
        backend.index("messages", 1, &doc("shared word")).await.unwrap();
        backend.remove("messages", 1).await.unwrap();

        assert_eq!(backend.query("posts", "shared", 0, 10).await.unwrap().total, 1);
        assert_eq!(backend.query("messages", "shared", 0, 10).await.unwrap().total, 0);
    }
}
