//! Per-request state. Created by [`Pipeline::run`](super::Pipeline::run) and
//! dropped when it returns.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::action_log::{ActionLogError, ActionOutcome, ActionRecord, ActionSink};
use crate::agents::Decision;
use crate::citation::{parse_page_markers, SourcePage};
use crate::memory::{KnowledgeItem, KnowledgeMemory};
use crate::narration::Stage;
use crate::vector_store::{DocumentMetadata, RetrievedChunk};

#[derive(Debug)]
pub struct PipelineState {
    pub request_id: Uuid,
    pub stage: Stage,
    pub memory: KnowledgeMemory,
    /// Embeddings of every chunk admitted so far.
    pub seen: Vec<Vec<f32>>,
    pub document: Option<DocumentMetadata>,
    pub decision: Option<Decision>,
    pub gap_fill_attempted: bool,
    pub concise: bool,
    pub refinements: u32,
    pub approved: bool,
    /// Pages behind each admitted item, keyed by the item's text.
    sources: Vec<(String, Vec<SourcePage>)>,
}

impl PipelineState {
    pub fn new(request_id: Uuid, token_limit: usize) -> Self {
        Self {
            request_id,
            stage: Stage::SearchInit,
            memory: KnowledgeMemory::new(token_limit),
            seen: Vec::new(),
            document: None,
            decision: None,
            gap_fill_attempted: false,
            concise: false,
            refinements: 0,
            approved: false,
            sources: Vec::new(),
        }
    }

    pub fn enter(&mut self, stage: Stage) {
        tracing::debug!(from = %self.stage, to = %stage, "stage transition");
        self.stage = stage;
    }

    pub fn filename(&self) -> Option<&str> {
        self.document.as_ref().map(|d| d.filename.as_str())
    }

    pub fn summary(&self) -> Option<&str> {
        self.document
            .as_ref()
            .map(|d| d.summary.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// Admit retrieved chunks and the knowledge drawn from them. Each item is
    /// paired with the index of its chunk. Returns how many items were stored.
    pub fn admit(
        &mut self,
        chunks: &[RetrievedChunk],
        extracted: Vec<(usize, KnowledgeItem)>,
    ) -> usize {
        self.seen.extend(chunks.iter().map(|c| c.embedding.clone()));
        let mut accepted = Vec::with_capacity(extracted.len());
        for (idx, item) in extracted {
            if !self.memory.accepts(&item.text) {
                continue;
            }
            if let Some(chunk) = chunks.get(idx) {
                self.sources.push((item.text.clone(), chunk_pages(chunk)));
            }
            accepted.push(item);
        }
        self.memory.update(accepted)
    }

    /// Pages of the items still in memory, one per page number, in page
    /// order. Content from several chunks of a page is merged.
    pub fn source_pages(&self) -> Vec<SourcePage> {
        let live: HashSet<&str> = self
            .memory
            .items()
            .iter()
            .map(|item| item.text.as_str())
            .collect();
        let mut merged: BTreeMap<u32, String> = BTreeMap::new();
        for page in self
            .sources
            .iter()
            .filter(|(text, _)| live.contains(text.as_str()))
            .flat_map(|(_, pages)| pages)
        {
            let content = merged.entry(page.page).or_default();
            if content.contains(page.content.as_str()) {
                continue;
            }
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            content.push_str(&page.content);
        }
        merged
            .into_iter()
            .map(|(page, content)| SourcePage::new(page, content))
            .collect()
    }
}

fn chunk_pages(chunk: &RetrievedChunk) -> Vec<SourcePage> {
    match chunk.page {
        Some(page) => vec![SourcePage::new(page, chunk.text.trim())],
        None => parse_page_markers(&chunk.text),
    }
}

/// Page a chunk came from: the store's page, else its first page marker.
pub fn page_of(chunk: &RetrievedChunk) -> Option<u32> {
    chunk
        .page
        .or_else(|| parse_page_markers(&chunk.text).first().map(|p| p.page))
}

/// Agent calls and spend for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunUsage {
    pub agent_calls: u32,
    pub failed_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

/// Forwards action records to the caller's sink and totals them.
pub(crate) struct TallySink {
    inner: Arc<dyn ActionSink>,
    usage: Mutex<RunUsage>,
}

impl TallySink {
    pub(crate) fn new(inner: Arc<dyn ActionSink>) -> Self {
        Self {
            inner,
            usage: Mutex::new(RunUsage::default()),
        }
    }

    pub(crate) fn usage(&self) -> RunUsage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }
}

impl ActionSink for TallySink {
    fn record(&self, record: ActionRecord) -> Result<(), ActionLogError> {
        if let Ok(mut usage) = self.usage.lock() {
            usage.agent_calls += 1;
            if matches!(record.outcome, ActionOutcome::Error { .. }) {
                usage.failed_calls += 1;
            }
            usage.input_tokens += u64::from(record.input_tokens);
            usage.output_tokens += u64::from(record.output_tokens);
            usage.cost_nanodollars += record.cost_nanodollars;
        }
        self.inner.record(record)
    }
}
