//! Provider gateway: chat completions via OpenRouter, embeddings via an
//! OpenAI-compatible endpoint.
//!
//! Agents and the citation attributor only see [`ChatGateway`] and
//! [`EmbedGateway`]. [`ProviderGateway`] implements both, retrying transient
//! failures and reporting every attempt to a [`UsageSink`].

pub mod embeddings;
pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use embeddings::{EmbedProvider, OpenAiEmbedder};
use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::ProviderCallRecord;

pub use error::{ErrorContext, ProviderError};
pub use pricing::*;
pub use types::*;
pub use usage::{MemoryUsageSink, NoopUsageSink, UsageSink, UsageTotals};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[async_trait::async_trait]
pub trait EmbedGateway: Send + Sync {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

/// Retry policy. `max_retries` counts attempts after the first.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSink> {
    openrouter: OpenRouterAdapter,
    embedder: Option<OpenAiEmbedder>,
    usage: Arc<U>,
    config: GatewayConfig,
}

impl<U: UsageSink> ProviderGateway<U> {
    /// Chat from `OPENROUTER_*`; embeddings only when `OPENAI_API_KEY` is set.
    pub fn from_env(usage: Arc<U>) -> Result<Self, ProviderError> {
        let embedder = if std::env::var_os("OPENAI_API_KEY").is_some() {
            Some(OpenAiEmbedder::from_env()?)
        } else {
            None
        };
        Ok(Self::with_config(
            OpenRouterAdapter::from_env()?,
            embedder,
            usage,
            GatewayConfig::default(),
        ))
    }

    pub fn with_config(
        openrouter: OpenRouterAdapter,
        embedder: Option<OpenAiEmbedder>,
        usage: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            openrouter,
            embedder,
            usage,
            config,
        }
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let req = &req;
        self.with_retries(req.attribution.caller, move || async move {
            let outcome = self.openrouter.chat(req).await;
            self.usage
                .record(ProviderCallRecord::chat(req, outcome.as_ref()))
                .await;
            outcome
        })
        .await
    }

    pub async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| ProviderError::config("no embeddings provider configured"))?;
        if req.texts.is_empty() {
            return Ok(EmbedResponse {
                embeddings: Vec::new(),
                tokens: 0,
                cost_nanodollars: 0,
                latency: Duration::ZERO,
            });
        }

        let req = &req;
        self.with_retries(req.attribution.caller, move || async move {
            let outcome = embedder.embed(req).await;
            self.usage
                .record(ProviderCallRecord::embed(req, outcome.as_ref()))
                .await;
            outcome
        })
        .await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        caller: &'static str,
        mut attempt_once: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match attempt_once().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= self.config.max_retries {
                return Err(err);
            }
            let wait = retry_delay(&err, self.config.retry_base_delay, attempt);
            tracing::warn!(caller, attempt, ?wait, error = %err, "provider call failed; retrying");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

#[async_trait::async_trait]
impl<U: UsageSink> EmbedGateway for ProviderGateway<U> {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        ProviderGateway::embed(self, req).await
    }
}

/// Exponential from `base`, doubling at most five times. A rate limit waits
/// for the provider's hint instead, capped at thirty times `base`.
fn retry_delay(err: &ProviderError, base: Duration, attempt: u32) -> Duration {
    let backoff = base * 2u32.pow(attempt.min(5));
    match err {
        ProviderError::RateLimited { retry_after, .. } => (*retry_after).min(base * 30).max(backoff),
        _ => backoff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_flattens() {
        let base = Duration::from_millis(100);
        let err = ProviderError::Timeout(Duration::from_secs(1));
        assert_eq!(retry_delay(&err, base, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(&err, base, 2), Duration::from_millis(400));
        assert_eq!(retry_delay(&err, base, 9), Duration::from_millis(3_200));
    }

    #[test]
    fn rate_limit_hint_is_capped() {
        let err = ProviderError::RateLimited {
            provider: "openrouter",
            retry_after: Duration::from_secs(60),
            context: ErrorContext::status(429),
        };
        assert_eq!(
            retry_delay(&err, Duration::from_millis(10), 0),
            Duration::from_millis(300)
        );
    }
}
