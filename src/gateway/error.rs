//! Failures from the chat and embedding providers.

use std::time::Duration;
use thiserror::Error;

/// What a failed HTTP response told us beyond its status line.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider's own code, e.g. `"rate_limit_exceeded"`.
    pub provider_code: Option<String>,
    /// `x-request-id` header, for support tickets.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn status(status: u16) -> Self {
        Self {
            http_status: Some(status),
            provider_code: None,
            request_id: None,
        }
    }

    pub fn with_code(self, code: impl Into<String>) -> Self {
        Self {
            provider_code: Some(code.into()),
            ..self
        }
    }

    pub fn with_request_id(self, request_id: Option<String>) -> Self {
        Self { request_id, ..self }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited by {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: &'static str,
        retry_after: Duration,
        context: ErrorContext,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The model declined to answer.
    #[error("refused: {0}")]
    Refused(String),

    /// Non-success status, or an error object inside a 200.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    #[error("{provider} returned an unreadable payload: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing key, bad base URL, no embedder wired in.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn provider_with_context(
        provider: &'static str,
        message: impl Into<String>,
        retryable: bool,
        context: ErrorContext,
    ) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: Some(context),
        }
    }

    pub fn decode(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            provider,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Rate limits, timeouts, 5xx and dropped connections are worth another
    /// attempt; anything the provider understood and rejected is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Stable code written to usage records and the action log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Refused(_) => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Decode { .. } => "decode_error",
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retried() {
        let limited = ProviderError::RateLimited {
            provider: "openrouter",
            retry_after: Duration::from_secs(1),
            context: ErrorContext::status(429),
        };
        assert!(limited.is_retryable());
        assert_eq!(limited.code(), "rate_limited");
        assert!(ProviderError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(ProviderError::provider("openrouter", "bad gateway", true).is_retryable());

        assert!(!ProviderError::Refused("no".into()).is_retryable());
        assert!(!ProviderError::decode("openai", "bad json").is_retryable());
        assert!(!ProviderError::config("no key").is_retryable());
    }

    #[test]
    fn context_is_attached_to_provider_errors() {
        let err = ProviderError::provider_with_context(
            "openai",
            "overloaded",
            true,
            ErrorContext::status(503).with_code("overloaded"),
        );
        match err {
            ProviderError::Provider {
                retryable, context, ..
            } => {
                assert!(retryable);
                let context = context.unwrap();
                assert_eq!(context.http_status, Some(503));
                assert_eq!(context.provider_code.as_deref(), Some("overloaded"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
