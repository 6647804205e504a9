//! Chat completions over the OpenRouter API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::chat_cost;
use super::types::*;

const PROVIDER: &str = "openrouter";
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Replies larger than this are rejected while streaming.
const MAX_RESPONSE_BYTES: usize = 1_024 * 1_024;

/// Prompts longer than this (about 125k tokens) are never sent.
const MAX_PROMPT_CHARS: usize = 500_000;

/// Wait suggested to the retry loop after a 429.
const RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    endpoint: String,
}

impl OpenRouterAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, DEFAULT_TIMEOUT, None)
    }

    /// Reads `OPENROUTER_API_KEY` plus the optional `OPENROUTER_BASE_URL`,
    /// `OPENROUTER_TIMEOUT_SECONDS` and `OPENROUTER_APP_TITLE`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::config("OPENROUTER_API_KEY not set"))?;
        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let timeout = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs);
        let app_title = std::env::var("OPENROUTER_APP_TITLE").ok();

        Self::with_config(api_key, base_url, timeout, app_title)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.into()))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, bearer);
        if let Some(title) = app_title.and_then(|t| HeaderValue::from_str(&t).ok()) {
            headers.insert("X-Title", title);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        let endpoint = format!(
            "{}/chat/completions",
            base_url.into().trim_end_matches('/')
        );
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct CompletionReply {
    choices: Option<Vec<ReplyChoice>>,
    usage: Option<ReplyUsage>,
    error: Option<ReplyError>,
}

#[derive(Deserialize)]
struct ReplyChoice {
    message: Option<ReplyMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ReplyToolCall>>,
}

#[derive(Deserialize)]
struct ReplyToolCall {
    function: Option<ReplyFunction>,
}

#[derive(Deserialize)]
struct ReplyFunction {
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ReplyUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    #[serde(default)]
    cost_details: Option<ReplyCostDetails>,
}

#[derive(Deserialize)]
struct ReplyCostDetails {
    upstream_inference_cost: Option<f64>,
}

#[derive(Deserialize)]
struct ReplyError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

impl ReplyMessage {
    /// Message text, or the first non-empty tool-call argument string when a
    /// model answers JSON mode through a tool call.
    fn into_text(self) -> String {
        match self.content {
            Some(text) if !text.trim().is_empty() => text,
            _ => self
                .tool_calls
                .into_iter()
                .flatten()
                .filter_map(|call| call.function.and_then(|f| f.arguments))
                .find(|args| !args.trim().is_empty())
                .unwrap_or_default(),
        }
    }
}

impl ReplyUsage {
    fn upstream_nanodollars(&self) -> Option<i64> {
        self.cost_details
            .as_ref()
            .and_then(|d| d.upstream_inference_cost)
            .map(|usd| ((usd * 1e9).round() as i64).max(0))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// A refusal opens with a refusal phrase or mentions a refused request.
/// Only the first line is checked for openers.
fn looks_like_refusal(text: &str) -> bool {
    const OPENERS: &[&str] = &[
        "refus",
        "i cannot",
        "i can't",
        "i won't",
        "i will not",
        "i am unable to",
        "i'm unable to",
        "unable to comply",
        "unable to assist",
    ];
    let lower = text.trim_start().to_lowercase();
    let opening = lower.lines().next().unwrap_or("");
    OPENERS.iter().any(|o| opening.starts_with(o)) || lower.contains("request was refused")
}

fn request_id_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Stream the body, failing once it grows past [`MAX_RESPONSE_BYTES`].
async fn read_capped(mut response: reqwest::Response) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(ProviderError::provider(
                PROVIDER,
                format!("Response too large: over {MAX_RESPONSE_BYTES} bytes"),
                false,
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Map a non-2xx reply. 429 is a rate limit; 5xx is retryable; an exceeded
/// context window never is.
fn status_error(status: u16, body: &str, ctx: ErrorContext) -> ProviderError {
    let error = serde_json::from_str::<CompletionReply>(body)
        .ok()
        .and_then(|r| r.error);
    let (message, ctx) = match error {
        Some(err) => {
            let ctx = match err.code {
                Some(serde_json::Value::String(code)) => ctx.with_code(code),
                Some(other) => ctx.with_code(other.to_string()),
                None => ctx,
            };
            (err.message.unwrap_or_default(), ctx)
        }
        None => (format!("HTTP {status}"), ctx),
    };

    match status {
        429 => ProviderError::RateLimited {
            provider: PROVIDER,
            retry_after: RATE_LIMIT_WAIT,
            context: ctx,
        },
        code => ProviderError::provider_with_context(PROVIDER, message, code >= 500, ctx),
    }
}

// =============================================================================
// Provider
// =============================================================================

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let prompt_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if prompt_chars > MAX_PROMPT_CHARS {
            return Err(ProviderError::InvalidRequest(format!(
                "Input too large: {prompt_chars} chars (max {MAX_PROMPT_CHARS})"
            )));
        }

        let started = Instant::now();
        let body = CompletionBody {
            model: req.model.model_id(),
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status().as_u16();
        let ctx = ErrorContext::status(status).with_request_id(request_id_header(response.headers()));
        let raw = read_capped(response).await?;

        if !(200..300).contains(&status) {
            return Err(status_error(status, &raw, ctx));
        }

        let reply: CompletionReply = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::decode(PROVIDER, format!("Invalid JSON: {e}")))?;

        if let Some(err) = reply.error {
            let message = err.message.unwrap_or_default();
            return Err(if looks_like_refusal(&message) {
                ProviderError::Refused(message)
            } else {
                ProviderError::provider(PROVIDER, message, false)
            });
        }

        let choice = reply
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::decode(PROVIDER, "No choices in response"))?;
        let content = choice.message.map(ReplyMessage::into_text).unwrap_or_default();
        if looks_like_refusal(&content) {
            return Err(ProviderError::Refused(content));
        }

        let usage = reply
            .usage
            .ok_or_else(|| ProviderError::decode(PROVIDER, "Missing usage in response"))?;
        let input_tokens = usage.prompt_tokens.unwrap_or(0);
        let output_tokens = usage.completion_tokens.unwrap_or(0);

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            cost_nanodollars: chat_cost(req.model.model_id(), input_tokens, output_tokens),
            upstream_cost_nanodollars: usage.upstream_nanodollars(),
            latency: started.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_detection_checks_first_line_only() {
        assert!(looks_like_refusal("I cannot help with that."));
        assert!(looks_like_refusal("  Refusing: policy"));
        assert!(!looks_like_refusal(
            "The pump runs at 40 bar.\nI cannot stress this enough."
        ));
    }

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let adapter = OpenRouterAdapter::with_config(
            "sk-test",
            "http://127.0.0.1:9/api/",
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        assert_eq!(adapter.endpoint(), "http://127.0.0.1:9/api/chat/completions");
    }

    #[test]
    fn context_overflow_is_not_retryable() {
        let err = status_error(
            400,
            r#"{"error": {"message": "Maximum context length exceeded", "code": 400}}"#,
            ErrorContext::status(400),
        );
        assert!(!err.is_retryable());
        match err {
            ProviderError::Provider { context, .. } => {
                assert_eq!(context.and_then(|c| c.provider_code).as_deref(), Some("400"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_errors_without_body_are_retryable() {
        let err = status_error(502, "<html>bad gateway</html>", ErrorContext::status(502));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "openrouter error: HTTP 502");
    }
}
