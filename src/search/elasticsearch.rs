//! Elasticsearch [`SearchBackend`] over the REST API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | index | `PUT /{collection}/_doc/{id}` |
//! | remove | `DELETE /{collection}/_doc/{id}` (404 is success) |
//! | query | `POST /{collection}/_search` with a `multi_match` over all fields |
//!
//! The password falls back to the `ELASTICSEARCH_PASSWORD` environment
//! variable when `[search].password` is not set.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::{SearchBackend, SearchHits};
use crate::config::SearchConfig;

pub struct ElasticsearchBackend {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticsearchBackend {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("search.url required for elasticsearch backend"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_certs)
            .build()?;

        let password = config
            .password
            .clone()
            .or_else(|| std::env::var("ELASTICSEARCH_PASSWORD").ok());

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }
}

#[async_trait]
impl SearchBackend for ElasticsearchBackend {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn index(&self, collection: &str, id: i64, document: &Map<String, Value>) -> Result<()> {
        let response = self
            .request(Method::PUT, &format!("{}/_doc/{}", collection, id))
            .json(document)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Elasticsearch index error {}: {}", status, body_text);
        }
        Ok(())
    }

    async fn remove(&self, collection: &str, id: i64) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("{}/_doc/{}", collection, id))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body_text = response.text().await.unwrap_or_default();
        bail!("Elasticsearch delete error {}: {}", status, body_text);
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        offset: i64,
        limit: i64,
    ) -> Result<SearchHits> {
        let response = self
            .request(Method::POST, &format!("{}/_search", collection))
            .json(&build_query_body(text, offset, limit))
            .send()
            .await?;

        let status = response.status();
        // Nothing has been indexed into this collection yet
        if status == StatusCode::NOT_FOUND {
            return Ok(SearchHits::empty());
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Elasticsearch search error {}: {}", status, body_text);
        }

        let json: Value = response.json().await?;
        parse_search_response(&json)
    }
}

fn build_query_body(text: &str, offset: i64, limit: i64) -> Value {
    json!({
        "query": {
            "multi_match": {
                "query": text,
                "fields": ["*"]
            }
        },
        "from": offset,
        "size": limit
    })
}

fn parse_search_response(json: &Value) -> Result<SearchHits> {
    let hits = json
        .get("hits")
        .ok_or_else(|| anyhow::anyhow!("Invalid Elasticsearch response: missing hits"))?;

    let total = match hits.get("total") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(obj) => obj.get("value").and_then(|v| v.as_i64()).unwrap_or(0),
        None => 0,
    };

    let ids = hits
        .get("hits")
        .and_then(|h| h.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Elasticsearch response: missing hits.hits"))?
        .iter()
        .filter_map(|hit| hit.get("_id").and_then(|id| id.as_str()))
        .map(|id| {
            id.parse::<i64>()
                .map_err(|_| anyhow::anyhow!("Non-integer document id in index: {}", id))
        })
        .collect::<Result<Vec<i64>>>()?;

    Ok(SearchHits { ids, total })
}
