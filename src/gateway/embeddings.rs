//! OpenAI-compatible embeddings adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::embedding_cost;
use super::types::{EmbedRequest, EmbedResponse};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Inputs per HTTP request.
const DEFAULT_BATCH_SIZE: usize = 96;

#[async_trait]
pub trait EmbedProvider: Send + Sync {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

/// Embeddings client for `/embeddings` on OpenAI or a compatible server.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    batch_size: usize,
}

impl OpenAiEmbedder {
    /// Create from `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::config("OPENAI_API_KEY not set"))?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self::with_config(api_key, base_url, Duration::from_secs(60), DEFAULT_BATCH_SIZE)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        batch_size: usize,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::config("missing embeddings API key"));
        }
        if batch_size == 0 {
            return Err(ProviderError::config("embedding batch size must be positive"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        let endpoint = format!("{}/embeddings", base_url.into().trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            batch_size,
        })
    }

    async fn embed_batch(
        &self,
        model: &str,
        inputs: &[String],
    ) -> Result<(Vec<Vec<f32>>, u32), ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbeddingApiRequest {
                model,
                input: inputs,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let ctx = ErrorContext::status(status.as_u16());
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited {
                    provider: PROVIDER,
                    retry_after: Duration::from_secs(20),
                    context: ctx,
                },
                code => ProviderError::provider_with_context(PROVIDER, body, code >= 500, ctx),
            });
        }

        let mut parsed: EmbeddingApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::decode(PROVIDER, e.to_string()))?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(ProviderError::decode(
                PROVIDER,
                format!(
                    "{} embeddings for {} inputs",
                    parsed.data.len(),
                    inputs.len()
                ),
            ));
        }

        let tokens = parsed.usage.map(|u| u.prompt_tokens).unwrap_or(0);
        Ok((
            parsed.data.into_iter().map(|e| e.embedding).collect(),
            tokens,
        ))
    }
}

#[derive(Serialize)]
struct EmbeddingApiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingEntry>,
    usage: Option<EmbeddingUsage>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingUsage {
    prompt_tokens: u32,
}

#[async_trait]
impl EmbedProvider for OpenAiEmbedder {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let start = Instant::now();
        let mut embeddings = Vec::with_capacity(req.texts.len());
        let mut tokens = 0u32;

        for batch in req.texts.chunks(self.batch_size) {
            let (vectors, used) = self.embed_batch(req.model.as_str(), batch).await?;
            embeddings.extend(vectors);
            tokens = tokens.saturating_add(used);
        }

        Ok(EmbedResponse {
            embeddings,
            tokens,
            cost_nanodollars: embedding_cost(req.model.as_str(), tokens),
            latency: start.elapsed(),
        })
    }
}
