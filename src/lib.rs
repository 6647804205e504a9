#![forbid(unsafe_code)]

//! # evidence-harness
//!
//! Answer questions from a document store with evidence you can trace.
//!
//! A question is rewritten into search queries, the retrieved chunks are
//! deduplicated by embedding similarity and distilled into knowledge, and an
//! answer is drafted, checked for references to missing sections, and refined
//! against an evaluator a bounded number of times. Finally every statement is
//! matched back to the source page it came from and annotated with a
//! `[n](page)` citation, while headings, tables, images and code pass through
//! untouched.
//!
//! Calls to the reasoning service go through [`gateway::ChatGateway`]; the
//! store is reached through [`vector_store::VectorStore`]. Both are traits so
//! tests can run the whole [`pipeline::Pipeline`] in-process.

pub mod action_log;
pub mod agents;
pub mod citation;
pub mod config;
pub mod fanout;
pub mod gateway;
pub mod images;
pub mod memory;
pub mod narration;
pub mod pipeline;
pub mod prompts;
pub mod similarity;
pub mod vector_store;

pub use action_log::{ActionRecord, ActionSink, JsonlActionSink, MemoryActionSink};
pub use agents::{AgentAction, AgentError, AgentRunner};
pub use citation::{Attributed, Attributor, Citation, EmbeddingAttributor, FactCheckAttributor};
pub use config::{AttributionMode, PipelineConfig};
pub use fanout::FanOut;
pub use gateway::{Attribution, ChatGateway, EmbedGateway, ProviderGateway, UsageSink};
pub use memory::{KnowledgeItem, KnowledgeMemory};
pub use narration::{Narration, Stage, StatusSink};
pub use pipeline::{Pipeline, PipelineError, PipelineOutput};
pub use vector_store::{HttpVectorStore, VectorStore};
