//! Vector-store collaborator: similarity search over document chunks plus a
//! listing of the indexed documents.
//!
//! The store's indexing is external. [`HttpVectorStore`] talks to it over
//! JSON:
//!
//! - `POST {base}/query` with `{"text", "k", "filename"?, "section"?}` returns
//!   `{"chunks": [{"text", "embedding", "page"?}]}`
//! - `GET {base}/metadata` returns
//!   `{"documents": [{"filename", "summary", "page_map"}]}`

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::similarity::Embedded;

/// Retrieved unit of source text. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub embedding: Vec<f32>,
    /// Source page, when the store tracks one. Chunks without a page may carry
    /// inline `{n}-----` markers instead.
    #[serde(default)]
    pub page: Option<u32>,
}

impl Embedded for RetrievedChunk {
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub filename: String,
    #[serde(default)]
    pub summary: String,
    /// Section title to first page.
    #[serde(default)]
    pub page_map: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorQuery {
    pub text: String,
    pub k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl VectorQuery {
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            filename: None,
            section: None,
        }
    }

    pub fn in_document(mut self, filename: Option<&str>) -> Self {
        self.filename = filename.map(str::to_string);
        self
    }

    pub fn in_section(mut self, section: impl Into<String>) -> Self {
        let section = section.into();
        self.section = (!section.trim().is_empty()).then_some(section);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("vector store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vector store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("vector store response could not be decoded: {0}")]
    Decode(String),
    #[error("vector store configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn query(&self, query: &VectorQuery) -> Result<Vec<RetrievedChunk>, VectorStoreError>;

    async fn metadata(&self) -> Result<Vec<DocumentMetadata>, VectorStoreError>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    chunks: Vec<RetrievedChunk>,
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    #[serde(default)]
    documents: Vec<DocumentMetadata>,
}

/// JSON-over-HTTP store client.
#[derive(Debug, Clone)]
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVectorStore {
    /// Create from `VECTOR_STORE_URL` and optional `VECTOR_STORE_API_KEY`.
    pub fn from_env() -> Result<Self, VectorStoreError> {
        let base_url = std::env::var("VECTOR_STORE_URL")
            .map_err(|_| VectorStoreError::Config("VECTOR_STORE_URL not set".into()))?;
        let api_key = std::env::var("VECTOR_STORE_API_KEY").ok();
        Self::with_config(base_url, api_key, Duration::from_secs(60))
    }

    pub fn with_config(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, VectorStoreError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(VectorStoreError::Config("empty base URL".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            let auth = HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                .map_err(|_| VectorStoreError::Config("invalid API key format".into()))?;
            headers.insert(AUTHORIZATION, auth);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| VectorStoreError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, VectorStoreError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let body: String = body.chars().take(500).collect();
            return Err(VectorStoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| VectorStoreError::Decode(e.to_string()))
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn query(&self, query: &VectorQuery) -> Result<Vec<RetrievedChunk>, VectorStoreError> {
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(query)
            .send()
            .await?;
        let parsed: QueryResponse = Self::decode(response).await?;
        Ok(parsed.chunks)
    }

    async fn metadata(&self) -> Result<Vec<DocumentMetadata>, VectorStoreError> {
        let response = self
            .client
            .get(format!("{}/metadata", self.base_url))
            .send()
            .await?;
        let parsed: MetadataResponse = Self::decode(response).await?;
        Ok(parsed.documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_omits_absent_filters() {
        let q = VectorQuery::new("pump pressure", 3).in_section("  ");
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json, serde_json::json!({"text": "pump pressure", "k": 3}));

        let q = VectorQuery::new("q", 2)
            .in_document(Some("manual.pdf"))
            .in_section("4.2 Wiring");
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["filename"], "manual.pdf");
        assert_eq!(json["section"], "4.2 Wiring");
    }

    #[test]
    fn chunk_page_is_optional() {
        let c: RetrievedChunk =
            serde_json::from_str(r#"{"text": "t", "embedding": [0.5, 0.5]}"#).unwrap();
        assert_eq!(c.page, None);
        assert_eq!(c.embedding(), &[0.5, 0.5]);
    }
}
