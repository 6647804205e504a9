//! Embedding-based attribution plus the collapse and numbering passes shared by
//! every attributor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::render::render;
use super::segment::{segment, Segment, SegmentKind};
use super::{is_citable, Attributed, AttributionError, Attributor, Citation, SourcePage};
use crate::fanout::FanOut;
use crate::gateway::{Attribution, EmbedGateway, EmbedModel, EmbedRequest, ProviderError};
use crate::similarity::best_match;

/// Longest run of same-page plain segments that shares one citation.
pub const MAX_COLLAPSE_RUN: usize = 3;

/// Pages with less trimmed content than this are never matched.
const MIN_PAGE_CHARS: usize = 10;

const DEFAULT_PAGE_CONCURRENCY: usize = 4;

/// Remove redundant page matches.
///
/// A list directly under a heading that carries the same page loses its match.
/// A run of consecutive plain segments matching one page keeps only the last
/// match of every group of [`MAX_COLLAPSE_RUN`].
pub fn collapse(segments: &[Segment], matches: &[Option<u32>]) -> Vec<Option<u32>> {
    let mut out = matches.to_vec();
    out.resize(segments.len(), None);

    for i in 0..segments.len() {
        let Some(page) = out[i] else { continue };
        if !segments[i].is(SegmentKind::Header) {
            continue;
        }
        let mut j = i + 1;
        while j < segments.len() && segments[j].is(SegmentKind::List) && out[j] == Some(page) {
            out[j] = None;
            j += 1;
        }
    }

    let mut i = 0;
    while i < segments.len() {
        let Some(page) = out[i].filter(|_| segments[i].is_plain()) else {
            i += 1;
            continue;
        };
        let mut end = i + 1;
        while end < segments.len() && segments[end].is_plain() && out[end] == Some(page) {
            end += 1;
        }
        for group_start in (i..end).step_by(MAX_COLLAPSE_RUN) {
            let group_end = (group_start + MAX_COLLAPSE_RUN).min(end);
            for slot in &mut out[group_start..group_end - 1] {
                *slot = None;
            }
        }
        i = end;
    }
    out
}

/// Assign citation numbers by first appearance.
///
/// Returns the per-segment citations and one entry per distinct page, ordered
/// by index.
pub fn number(matches: &[Option<u32>]) -> (Vec<Option<Citation>>, Vec<Citation>) {
    let mut assigned: HashMap<u32, u32> = HashMap::new();
    let mut pages = Vec::new();
    let per_segment = matches
        .iter()
        .map(|m| {
            m.map(|page| {
                let next = assigned.len() as u32 + 1;
                let index = *assigned.entry(page).or_insert_with(|| {
                    pages.push(Citation { index: next, page });
                    next
                });
                Citation { index, page }
            })
        })
        .collect();
    (per_segment, pages)
}

/// Collapse, number and render. Without a single match the answer is returned
/// as given.
pub fn assemble(answer: &str, segments: &[Segment], matches: &[Option<u32>]) -> Attributed {
    if matches.iter().all(Option::is_none) {
        return Attributed::unchanged(answer);
    }
    let collapsed = collapse(segments, matches);
    let (per_segment, citations) = number(&collapsed);
    Attributed {
        text: render(segments, &per_segment),
        citations,
    }
}

/// Matches each citable segment to the most similar source page.
pub struct EmbeddingAttributor {
    gateway: Arc<dyn EmbedGateway>,
    model: EmbedModel,
    threshold: f32,
    min_length: usize,
    page_concurrency: usize,
}

impl EmbeddingAttributor {
    /// `threshold` is exclusive: a best score equal to it stays uncited.
    pub fn new(
        gateway: Arc<dyn EmbedGateway>,
        model: EmbedModel,
        threshold: f32,
        min_length: usize,
    ) -> Self {
        Self {
            gateway,
            model,
            threshold,
            min_length,
            page_concurrency: DEFAULT_PAGE_CONCURRENCY,
        }
    }

    /// Bound on concurrent single-page requests after a batch failure.
    pub fn with_page_concurrency(mut self, limit: usize) -> Self {
        self.page_concurrency = limit;
        self
    }

    async fn embed_pages(
        &self,
        texts: Vec<String>,
        request_id: Uuid,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let expected = texts.len();
        let req = EmbedRequest::new(
            self.model.clone(),
            texts,
            Attribution::new("citation::pages").with_request(request_id),
        );
        let embeddings = self.gateway.embed(req).await?.embeddings;
        if embeddings.len() != expected {
            return Err(ProviderError::decode(
                self.model.provider(),
                format!("expected {expected} page embeddings, got {}", embeddings.len()),
            ));
        }
        Ok(embeddings)
    }

    /// One vector per page, `None` where the page cannot be matched.
    async fn page_vectors(&self, pages: &[SourcePage], request_id: Uuid) -> Vec<Option<Vec<f32>>> {
        let mut vectors: Vec<Option<Vec<f32>>> = pages
            .iter()
            .map(|p| p.embedding.clone().filter(|v| !v.is_empty()))
            .collect();

        let pending: Vec<usize> = pages
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                vectors[*i].is_none() && p.content.trim().chars().count() >= MIN_PAGE_CHARS
            })
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return vectors;
        }

        let texts = pending.iter().map(|&i| pages[i].content.clone()).collect();
        match self.embed_pages(texts, request_id).await {
            Ok(embeddings) => {
                for (i, vector) in pending.into_iter().zip(embeddings) {
                    vectors[i] = Some(vector);
                }
            }
            Err(e) if pending.len() > 1 => {
                warn!(error = %e, pages = pending.len(), "batched page embedding failed; embedding pages one by one");
                let fan = FanOut::new("citation_pages", self.page_concurrency);
                let tasks: Vec<_> = pending
                    .iter()
                    .map(|&i| self.embed_pages(vec![pages[i].content.clone()], request_id))
                    .collect();
                let results = fan.results(tasks).await;
                for (i, result) in pending.into_iter().zip(results) {
                    match result {
                        Ok(mut one) => vectors[i] = one.pop(),
                        Err(e) => warn!(page = pages[i].page, error = %e, "page embedding failed; page left unmatched"),
                    }
                }
            }
            Err(e) => warn!(page = pages[pending[0]].page, error = %e, "page embedding failed; page left unmatched"),
        }
        vectors
    }
}

#[async_trait]
impl Attributor for EmbeddingAttributor {
    async fn attribute(
        &self,
        answer: &str,
        pages: &[SourcePage],
        request_id: Uuid,
    ) -> Result<Attributed, AttributionError> {
        let segments = segment(answer);
        let citable: Vec<usize> = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| is_citable(s, self.min_length))
            .map(|(i, _)| i)
            .collect();
        if citable.is_empty() || pages.is_empty() {
            return Ok(Attributed::unchanged(answer));
        }

        let page_vectors = self.page_vectors(pages, request_id).await;
        let candidates: Vec<(u32, &[f32])> = pages
            .iter()
            .zip(&page_vectors)
            .filter_map(|(p, v)| v.as_deref().map(|v| (p.page, v)))
            .collect();
        if candidates.is_empty() {
            debug!("no matchable pages");
            return Ok(Attributed::unchanged(answer));
        }

        let req = EmbedRequest::new(
            self.model.clone(),
            citable.iter().map(|&i| segments[i].text.clone()).collect(),
            Attribution::new("citation::segments").with_request(request_id),
        );
        let segment_vectors = self.gateway.embed(req).await?.embeddings;

        if let Some(first) = segment_vectors.first() {
            if !candidates.iter().any(|(_, v)| v.len() == first.len()) {
                return Err(AttributionError::DimensionMismatch {
                    segment: first.len(),
                    page: candidates[0].1.len(),
                });
            }
        }

        let mut matches = vec![None; segments.len()];
        for (&idx, vector) in citable.iter().zip(&segment_vectors) {
            if let Some((best, score)) = best_match(vector, candidates.iter().map(|(_, v)| *v)) {
                if score > self.threshold {
                    matches[idx] = Some(candidates[best].0);
                }
            }
        }
        Ok(assemble(answer, &segments, &matches))
    }
}
