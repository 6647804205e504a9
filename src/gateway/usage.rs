//! Per-call usage records.
//!
//! The gateway reports every attempt, failed ones included, to a
//! [`UsageSink`]. The CLI keeps them in a [`MemoryUsageSink`] and prints the
//! totals for the run.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::error::ProviderError;
use super::types::{ChatRequest, ChatResponse, EmbedRequest, EmbedResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endpoint {
    #[serde(rename = "chat/completions")]
    Chat,
    #[serde(rename = "embeddings")]
    Embeddings,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<Uuid>,
    pub caller: &'static str,
    pub provider: &'static str,
    pub endpoint: Endpoint,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub upstream_cost_nanodollars: Option<i64>,
    pub latency_ms: u64,
    /// Set when the attempt failed; see [`ProviderError::code`].
    pub error_code: Option<String>,
}

impl ProviderCallRecord {
    fn blank(
        provider: &'static str,
        endpoint: Endpoint,
        model: &str,
        caller: &'static str,
        request_id: Option<Uuid>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id,
            caller,
            provider,
            endpoint,
            model: model.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            latency_ms: 0,
            error_code: None,
        }
    }

    pub fn chat(req: &ChatRequest, outcome: Result<&ChatResponse, &ProviderError>) -> Self {
        let mut record = Self::blank(
            req.model.provider(),
            Endpoint::Chat,
            req.model.model_id(),
            req.attribution.caller,
            req.attribution.request_id,
        );
        match outcome {
            Ok(resp) => {
                record.input_tokens = resp.input_tokens;
                record.output_tokens = resp.output_tokens;
                record.cost_nanodollars = resp.cost_nanodollars;
                record.upstream_cost_nanodollars = resp.upstream_cost_nanodollars;
                record.latency_ms = resp.latency.as_millis() as u64;
            }
            Err(err) => record.error_code = Some(err.code().to_string()),
        }
        record
    }

    pub fn embed(req: &EmbedRequest, outcome: Result<&EmbedResponse, &ProviderError>) -> Self {
        let mut record = Self::blank(
            req.model.provider(),
            Endpoint::Embeddings,
            req.model.as_str(),
            req.attribution.caller,
            req.attribution.request_id,
        );
        match outcome {
            Ok(resp) => {
                record.input_tokens = resp.tokens;
                record.cost_nanodollars = resp.cost_nanodollars;
                record.latency_ms = resp.latency.as_millis() as u64;
            }
            Err(err) => record.error_code = Some(err.code().to_string()),
        }
        record
    }

    pub fn failed(&self) -> bool {
        self.error_code.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub calls: u32,
    pub failed_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

impl<'a> FromIterator<&'a ProviderCallRecord> for UsageTotals {
    fn from_iter<I: IntoIterator<Item = &'a ProviderCallRecord>>(records: I) -> Self {
        records.into_iter().fold(Self::default(), |mut acc, r| {
            acc.calls += 1;
            acc.failed_calls += u32::from(r.failed());
            acc.input_tokens += u64::from(r.input_tokens);
            acc.output_tokens += u64::from(r.output_tokens);
            acc.cost_nanodollars += r.cost_nanodollars;
            acc
        })
    }
}

/// Receives one record per provider attempt. Must not fail the call it
/// describes.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Keeps every record and logs each one at debug level.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProviderCallRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Totals for one answer run, or for everything when `request_id` is
    /// `None`.
    pub fn totals(&self, request_id: Option<Uuid>) -> UsageTotals {
        let Ok(records) = self.records.lock() else {
            return UsageTotals::default();
        };
        records
            .iter()
            .filter(|r| request_id.is_none() || r.request_id == request_id)
            .collect()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::debug!(
            caller = record.caller,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost_nanos = record.cost_nanodollars,
            error = record.error_code.as_deref().unwrap_or("-"),
            "provider call"
        );
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(_) => tracing::warn!("usage records poisoned; dropping record"),
        }
    }
}
