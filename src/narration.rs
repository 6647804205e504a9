//! Progress messages for whoever is watching a request.
//!
//! Each [`Narration`] maps to a fixed [`Stage`] and a formatted message.
//! Delivery is fire-and-forget through a [`StatusSink`].

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use crate::agents::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SearchInit,
    MetadataExtract,
    DocSelect,
    QueryRefine,
    ChunkRetrieve,
    KnowledgeExtract,
    Decide,
    AnswerGenerate,
    GapFill,
    AnswerEvaluate,
    AnswerRefine,
    Attribute,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SearchInit => "search_init",
            Stage::MetadataExtract => "metadata_extract",
            Stage::DocSelect => "doc_select",
            Stage::QueryRefine => "query_refine",
            Stage::ChunkRetrieve => "chunk_retrieve",
            Stage::KnowledgeExtract => "knowledge_extract",
            Stage::Decide => "decide",
            Stage::AnswerGenerate => "answer_generate",
            Stage::GapFill => "gap_fill",
            Stage::AnswerEvaluate => "answer_evaluate",
            Stage::AnswerRefine => "answer_refine",
            Stage::Attribute => "attribute",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Narration {
    SearchStarted,
    DocumentsListed { count: usize },
    DocumentSelected { filename: String },
    QueriesRewritten { count: usize },
    ChunksRetrieved { count: usize },
    KnowledgeExtracted { count: usize },
    Decided { decision: Decision },
    AnswerDrafted { concise: bool },
    GapsFilled { gaps: usize, added: usize },
    Evaluated { iteration: u32, approved: bool },
    Improved { iteration: u32 },
    Attributed { citations: usize },
    Finished,
}

impl Narration {
    pub fn stage(&self) -> Stage {
        match self {
            Narration::SearchStarted => Stage::SearchInit,
            Narration::DocumentsListed { .. } => Stage::MetadataExtract,
            Narration::DocumentSelected { .. } => Stage::DocSelect,
            Narration::QueriesRewritten { .. } => Stage::QueryRefine,
            Narration::ChunksRetrieved { .. } => Stage::ChunkRetrieve,
            Narration::KnowledgeExtracted { .. } => Stage::KnowledgeExtract,
            Narration::Decided { .. } => Stage::Decide,
            Narration::AnswerDrafted { .. } => Stage::AnswerGenerate,
            Narration::GapsFilled { .. } => Stage::GapFill,
            Narration::Evaluated { .. } => Stage::AnswerEvaluate,
            Narration::Improved { .. } => Stage::AnswerRefine,
            Narration::Attributed { .. } => Stage::Attribute,
            Narration::Finished => Stage::Done,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Narration::SearchStarted => "Starting search process...".to_string(),
            Narration::DocumentsListed { count } => {
                format!("Analyzing {count} available {}...", plural(*count, "document"))
            }
            Narration::DocumentSelected { filename } => {
                format!("Selected most relevant document: {filename}")
            }
            Narration::QueriesRewritten { count } => format!(
                "Reformulated query into {count} {} to match document content",
                plural(*count, "search")
            ),
            Narration::ChunksRetrieved { count } => {
                format!("Retrieved {count} {}", plural(*count, "chunk"))
            }
            Narration::KnowledgeExtracted { count } => {
                format!("Extracted {count} {}", plural(*count, "piece") + " of knowledge")
            }
            Narration::Decided { decision } => match decision {
                Decision::Answer => "Enough information gathered to answer".to_string(),
                Decision::Reflect => "Some details may be missing; answering with what was found".to_string(),
            },
            Narration::AnswerDrafted { concise: false } => {
                "Composing answer based on extracted information".to_string()
            }
            Narration::AnswerDrafted { concise: true } => {
                "Composing a shorter answer based on extracted information".to_string()
            }
            Narration::GapsFilled { gaps: 0, .. } => "No referenced sections missing".to_string(),
            Narration::GapsFilled { gaps, added } => format!(
                "Looked up {gaps} referenced {}; added {added} {}",
                plural(*gaps, "section"),
                plural(*added, "fact")
            ),
            Narration::Evaluated {
                iteration,
                approved,
            } => {
                let prefix = match iteration {
                    1 => "Evaluating answer quality...",
                    2 => "Re-evaluating answer...",
                    _ => "Final answer evaluation...",
                };
                format!("{prefix} Improvement needed: {}", !approved)
            }
            Narration::Improved { iteration } => match iteration {
                1 => "Refining answer for accuracy and completeness".to_string(),
                2 => "Making additional improvements to answer".to_string(),
                _ => "Finalizing answer improvements".to_string(),
            },
            Narration::Attributed { citations } => {
                format!("Linked answer to {citations} source {}", plural(*citations, "page"))
            }
            Narration::Finished => "Answer ready".to_string(),
        }
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        word.to_string()
    } else if word.ends_with('h') {
        format!("{word}es")
    } else {
        format!("{word}s")
    }
}

/// Receives stage updates. Must not block.
pub trait StatusSink: Send + Sync {
    fn notify(&self, stage: Stage, message: &str);

    fn narrate(&self, narration: &Narration) {
        self.notify(narration.stage(), &narration.message());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatusSink;

impl StatusSink for NoopStatusSink {
    fn notify(&self, _stage: Stage, _message: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn notify(&self, stage: Stage, message: &str) {
        tracing::info!(stage = %stage, "{message}");
    }
}

/// Collects updates in order.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    events: Mutex<Vec<(Stage, String)>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Stage, String)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events().into_iter().map(|(stage, _)| stage).collect()
    }
}

impl StatusSink for MemoryStatusSink {
    fn notify(&self, stage: Stage, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push((stage, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_pluralise_counts() {
        assert_eq!(
            Narration::ChunksRetrieved { count: 1 }.message(),
            "Retrieved 1 chunk"
        );
        assert_eq!(
            Narration::QueriesRewritten { count: 4 }.message(),
            "Reformulated query into 4 searches to match document content"
        );
        assert_eq!(
            Narration::KnowledgeExtracted { count: 3 }.message(),
            "Extracted 3 pieces of knowledge"
        );
    }

    #[test]
    fn evaluation_messages_follow_iteration() {
        let n = Narration::Evaluated {
            iteration: 2,
            approved: false,
        };
        assert_eq!(n.stage(), Stage::AnswerEvaluate);
        assert_eq!(n.message(), "Re-evaluating answer... Improvement needed: true");
    }

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemoryStatusSink::new();
        sink.narrate(&Narration::SearchStarted);
        sink.narrate(&Narration::Finished);
        assert_eq!(sink.stages(), vec![Stage::SearchInit, Stage::Done]);
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(Stage::ChunkRetrieve.to_string(), "chunk_retrieve");
        assert_eq!(
            serde_json::to_value(Stage::AnswerRefine).unwrap(),
            "answer_refine"
        );
    }
}
