//! Pipeline configuration.
//!
//! Every field has a default, so `{}` is a valid config file. Similarity
//! thresholds live here rather than in the algorithms that use them.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMode {
    /// Cosine similarity between statements and source pages.
    #[default]
    Embedding,
    /// One verification call per statement and page.
    FactCheck,
    /// Return the answer without citations.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Reasoning model for selection, rewriting, extraction and evaluation.
    #[serde(default = "default_model")]
    pub model: String,
    /// Model that drafts and improves answers.
    #[serde(default = "default_model")]
    pub answer_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Chunks requested per search query.
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,
    /// Rewritten queries kept, not counting the original.
    #[serde(default = "default_max_rewrites")]
    pub max_rewrites: usize,

    #[serde(default = "default_retrieval_concurrency")]
    pub retrieval_concurrency: usize,
    #[serde(default = "default_extraction_concurrency")]
    pub extraction_concurrency: usize,
    #[serde(default = "default_gap_concurrency")]
    pub gap_concurrency: usize,
    /// Parallel verification and image lookup calls.
    #[serde(default = "default_verification_concurrency")]
    pub verification_concurrency: usize,

    #[serde(default = "default_dedup_threshold")]
    pub retrieval_dedup_threshold: f32,
    #[serde(default = "default_dedup_threshold")]
    pub knowledge_dedup_threshold: f32,
    /// A page is cited only when its similarity is strictly above this.
    #[serde(default = "default_citation_threshold")]
    pub citation_threshold: f32,
    /// Shortest statement, in characters, that can carry a citation.
    #[serde(default = "default_citation_min_length")]
    pub citation_min_length: usize,

    /// Evaluate/improve rounds.
    #[serde(default = "default_max_refinements")]
    pub max_refinements: u32,
    #[serde(default = "default_knowledge_token_limit")]
    pub knowledge_token_limit: usize,

    /// Keep the raw chunk when its extraction fails.
    #[serde(default)]
    pub degrade_failed_extraction: bool,
    #[serde(default = "default_true")]
    pub select_document: bool,
    #[serde(default = "default_true")]
    pub fill_missing_sections: bool,
    #[serde(default)]
    pub attribution: AttributionMode,
    #[serde(default = "default_true")]
    pub integrate_images: bool,
}

fn default_model() -> String {
    "google/gemini-2.0-flash-001".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_retrieval_k() -> usize {
    3
}

fn default_max_rewrites() -> usize {
    5
}

fn default_retrieval_concurrency() -> usize {
    8
}

fn default_extraction_concurrency() -> usize {
    4
}

fn default_gap_concurrency() -> usize {
    4
}

fn default_verification_concurrency() -> usize {
    4
}

fn default_dedup_threshold() -> f32 {
    0.85
}

fn default_citation_threshold() -> f32 {
    0.5
}

fn default_citation_min_length() -> usize {
    30
}

fn default_max_refinements() -> u32 {
    3
}

fn default_knowledge_token_limit() -> usize {
    crate::memory::DEFAULT_TOKEN_LIMIT
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            answer_model: default_model(),
            embedding_model: default_embedding_model(),
            retrieval_k: default_retrieval_k(),
            max_rewrites: default_max_rewrites(),
            retrieval_concurrency: default_retrieval_concurrency(),
            extraction_concurrency: default_extraction_concurrency(),
            gap_concurrency: default_gap_concurrency(),
            verification_concurrency: default_verification_concurrency(),
            retrieval_dedup_threshold: default_dedup_threshold(),
            knowledge_dedup_threshold: default_dedup_threshold(),
            citation_threshold: default_citation_threshold(),
            citation_min_length: default_citation_min_length(),
            max_refinements: default_max_refinements(),
            knowledge_token_limit: default_knowledge_token_limit(),
            degrade_failed_extraction: false,
            select_document: true,
            fill_missing_sections: true,
            attribution: AttributionMode::default(),
            integrate_images: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("retrieval_dedup_threshold", self.retrieval_dedup_threshold),
            ("knowledge_dedup_threshold", self.knowledge_dedup_threshold),
            ("citation_threshold", self.citation_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [-1, 1], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("retrieval_k", self.retrieval_k),
            ("retrieval_concurrency", self.retrieval_concurrency),
            ("extraction_concurrency", self.extraction_concurrency),
            ("gap_concurrency", self.gap_concurrency),
            ("verification_concurrency", self.verification_concurrency),
            ("knowledge_token_limit", self.knowledge_token_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.max_refinements == 0 {
            return Err(ConfigError::Invalid(
                "max_refinements must be at least 1".to_string(),
            ));
        }
        if self.model.trim().is_empty() || self.answer_model.trim().is_empty() {
            return Err(ConfigError::Invalid("model names must not be empty".to_string()));
        }
        Ok(())
    }
}
