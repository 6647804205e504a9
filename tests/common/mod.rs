#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use evidence_harness::agents::AgentAction;
use evidence_harness::gateway::{
    ChatGateway, ChatRequest, ChatResponse, EmbedGateway, EmbedRequest, EmbedResponse,
    FinishReason, ProviderError,
};
use evidence_harness::vector_store::{
    DocumentMetadata, RetrievedChunk, VectorQuery, VectorStore, VectorStoreError,
};

pub const DIMENSIONS: usize = 256;

type Handler = Box<dyn Fn(&ChatRequest) -> Result<String, ProviderError> + Send + Sync>;

/// Chat gateway answering each agent action from a scripted handler.
/// Unscripted actions fail with `InvalidRequest`.
#[derive(Default)]
pub struct ScriptedGateway {
    handlers: HashMap<&'static str, Handler>,
    seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, action: AgentAction, handler: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        self.handlers.insert(action.caller(), Box::new(handler));
        self
    }

    pub fn reply(self, action: AgentAction, content: &str) -> Self {
        let content = content.to_string();
        self.on(action, move |_| Ok(content.clone()))
    }

    /// Replies in order; the last reply repeats once the list runs out.
    pub fn sequence(self, action: AgentAction, replies: &[&str]) -> Self {
        let replies: Vec<String> = replies.iter().map(|r| r.to_string()).collect();
        let next = AtomicUsize::new(0);
        self.on(action, move |_| {
            let idx = next.fetch_add(1, Ordering::SeqCst).min(replies.len() - 1);
            Ok(replies[idx].clone())
        })
    }

    pub fn fail(self, action: AgentAction) -> Self {
        self.on(action, |_| {
            Err(ProviderError::provider("scripted", "upstream unavailable", false))
        })
    }

    pub fn requests(&self, action: AgentAction) -> Vec<ChatRequest> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.attribution.caller == action.caller())
            .cloned()
            .collect()
    }

    pub fn calls(&self, action: AgentAction) -> usize {
        self.requests(action).len()
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.seen.lock().unwrap().push(req.clone());
        let handler = self.handlers.get(req.attribution.caller).ok_or_else(|| {
            ProviderError::InvalidRequest(format!("unscripted caller {}", req.attribution.caller))
        })?;
        let content = handler(&req)?;
        Ok(ChatResponse {
            content,
            input_tokens: 100,
            output_tokens: 20,
            cost_nanodollars: 1_000,
            upstream_cost_nanodollars: None,
            latency: Duration::from_millis(1),
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Text between `start` and `end`, trimmed.
pub fn between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = s.find(start)? + start.len();
    let rest = &s[from..];
    let to = rest.find(end)?;
    Some(rest[..to].trim())
}

/// The chunk an extraction request was made for.
pub fn chunk_of(req: &ChatRequest) -> String {
    between(&req.user_text(), "<document_chunk>", "</document_chunk>")
        .unwrap_or_default()
        .to_string()
}

pub fn is_compressed(req: &ChatRequest) -> bool {
    req.messages
        .first()
        .is_some_and(|m| m.content.contains("4000 tokens"))
}

/// Extraction that returns the chunk itself as the knowledge.
pub fn echo_knowledge(req: &ChatRequest) -> Result<String, ProviderError> {
    Ok(serde_json::json!({ "knowledge": chunk_of(req) }).to_string())
}

/// Hashed bag of words over lowercase words of four or more letters.
pub fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; DIMENSIONS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= 4)
    {
        let hash = blake3::hash(word.as_bytes());
        let bytes = hash.as_bytes();
        let idx = u16::from_le_bytes([bytes[0], bytes[1]]) as usize % DIMENSIONS;
        v[idx] += 1.0;
    }
    v
}

#[derive(Default)]
pub struct HashEmbedder {
    fail: bool,
    callers: Mutex<Vec<&'static str>>,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self, caller: &str) -> usize {
        self.callers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == caller)
            .count()
    }
}

#[async_trait]
impl EmbedGateway for HashEmbedder {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        self.callers.lock().unwrap().push(req.attribution.caller);
        if self.fail {
            return Err(ProviderError::Timeout(Duration::from_secs(30)));
        }
        Ok(EmbedResponse {
            embeddings: req.texts.iter().map(|t| embed_text(t)).collect(),
            tokens: 0,
            cost_nanodollars: 0,
            latency: Duration::ZERO,
        })
    }
}

pub fn chunk(text: &str, page: Option<u32>) -> RetrievedChunk {
    RetrievedChunk {
        text: text.to_string(),
        embedding: embed_text(text),
        page,
    }
}

/// Vector store answering from fixed tables keyed by query text or section.
#[derive(Default)]
pub struct StaticVectorStore {
    documents: Vec<DocumentMetadata>,
    by_query: HashMap<String, Vec<RetrievedChunk>>,
    by_section: HashMap<String, Vec<RetrievedChunk>>,
    failing: Vec<String>,
    queries: Mutex<Vec<VectorQuery>>,
}

impl StaticVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(mut self, filename: &str, summary: &str) -> Self {
        self.documents.push(DocumentMetadata {
            filename: filename.to_string(),
            summary: summary.to_string(),
            page_map: Default::default(),
        });
        self
    }

    pub fn on_query(mut self, text: &str, chunks: Vec<RetrievedChunk>) -> Self {
        self.by_query.insert(text.to_string(), chunks);
        self
    }

    pub fn on_section(mut self, section: &str, chunks: Vec<RetrievedChunk>) -> Self {
        self.by_section.insert(section.to_string(), chunks);
        self
    }

    pub fn failing_query(mut self, text: &str) -> Self {
        self.failing.push(text.to_string());
        self
    }

    pub fn queries(&self) -> Vec<VectorQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl VectorStore for StaticVectorStore {
    async fn query(&self, query: &VectorQuery) -> Result<Vec<RetrievedChunk>, VectorStoreError> {
        self.queries.lock().unwrap().push(query.clone());
        if self.failing.contains(&query.text) {
            return Err(VectorStoreError::Status {
                status: 503,
                body: "index offline".to_string(),
            });
        }
        let table = match &query.section {
            Some(section) => self.by_section.get(section),
            None => self.by_query.get(&query.text),
        };
        Ok(table
            .map(|chunks| chunks.iter().take(query.k).cloned().collect())
            .unwrap_or_default())
    }

    async fn metadata(&self) -> Result<Vec<DocumentMetadata>, VectorStoreError> {
        Ok(self.documents.clone())
    }
}

