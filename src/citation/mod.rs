//! Citation attribution: map statements in a drafted answer back to the source
//! pages they came from and annotate them with `[n](page)` markers.
//!
//! Two strategies implement [`Attributor`]:
//! - [`EmbeddingAttributor`]: cosine similarity between segment and page vectors.
//! - [`FactCheckAttributor`]: asks the reasoning service whether each page
//!   supports each statement.
//!
//! Both share segmentation ([`segment`]), collapse and numbering
//! ([`attribute::assemble`]) and reconstruction ([`render`]).

pub mod attribute;
pub mod render;
pub mod segment;
pub mod verify;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::agents::AgentError;
use crate::gateway::ProviderError;

pub use attribute::{assemble, collapse, number, EmbeddingAttributor};
pub use segment::{segment, Segment, SegmentKind};
pub use verify::FactCheckAttributor;

/// A page of source material that answer statements can be attributed to.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePage {
    pub page: u32,
    pub content: String,
    /// Precomputed vector; attributors that need one embed `content` otherwise.
    pub embedding: Option<Vec<f32>>,
}

impl SourcePage {
    pub fn new(page: u32, content: impl Into<String>) -> Self {
        Self {
            page,
            content: content.into(),
            embedding: None,
        }
    }
}

/// Sequential citation number assigned to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub index: u32,
    pub page: u32,
}

/// Annotated answer plus one entry per cited page, in order of first appearance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attributed {
    pub text: String,
    pub citations: Vec<Citation>,
}

impl Attributed {
    pub fn unchanged(text: &str) -> Self {
        Self {
            text: text.to_string(),
            citations: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("segment embedding failed: {0}")]
    Embedding(#[from] ProviderError),
    #[error("fact verification failed: {0}")]
    Agent(#[from] AgentError),
    #[error("segment vectors have {segment} dimensions but page vectors have {page}")]
    DimensionMismatch { segment: usize, page: usize },
}

#[async_trait]
pub trait Attributor: Send + Sync {
    async fn attribute(
        &self,
        answer: &str,
        pages: &[SourcePage],
        request_id: Uuid,
    ) -> Result<Attributed, AttributionError>;
}

/// Minimum length and exclusion rules shared by both attributors.
pub fn is_citable(segment: &Segment, min_length: usize) -> bool {
    if segment.protected {
        return false;
    }
    if segment.text.chars().count() < min_length {
        return false;
    }
    let lower = segment.text.to_lowercase();
    if lower.contains("refer to section") || lower.contains("see section") {
        return false;
    }
    // Remedy lists are procedures, not quotations.
    !(segment.is(SegmentKind::List) && lower.contains("remedy:"))
}

static PAGE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\d+)\}-+").expect("invalid page marker regex"));

/// Split text carrying `{n}-----` markers into pages.
///
/// Markers are zero-based, so `{0}` opens page 1. Text before the first marker
/// is ignored; text without markers yields no pages.
pub fn parse_page_markers(text: &str) -> Vec<SourcePage> {
    let markers: Vec<_> = PAGE_MARKER.captures_iter(text).collect();
    markers
        .iter()
        .enumerate()
        .filter_map(|(i, caps)| {
            let whole = caps.get(0)?;
            let number: u32 = caps.get(1)?.as_str().parse().ok()?;
            let end = markers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(text.len(), |m| m.start());
            Some(SourcePage::new(
                number.saturating_add(1),
                text[whole.end()..end].trim(),
            ))
        })
        .collect()
}
