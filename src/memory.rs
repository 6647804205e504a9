//! Per-request store of validated knowledge snippets.

use once_cell::sync::Lazy;
use serde::Serialize;
use tiktoken_rs::{o200k_base, CoreBPE};

use crate::similarity::{self, Embedded};

/// Knowledge longer than this many tokens is rejected.
pub const DEFAULT_TOKEN_LIMIT: usize = 4096;

/// Phrases that mark an extraction as a refusal or a negative result.
const REJECT_PHRASES: &[&str] = &["sorry", "does not contain"];

static TOKENIZER: Lazy<CoreBPE> =
    Lazy::new(|| o200k_base().expect("Failed to load o200k_base tokenizer"));

pub fn count_tokens(text: &str) -> usize {
    TOKENIZER.encode_with_special_tokens(text).len()
}

/// A validated fact snippet and the page of the chunk it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnowledgeItem {
    pub text: String,
    pub page: Option<u32>,
}

impl KnowledgeItem {
    pub fn new(text: impl Into<String>, page: Option<u32>) -> Self {
        Self {
            text: text.into(),
            page,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeMemory {
    items: Vec<KnowledgeItem>,
    token_limit: usize,
}

impl Default for KnowledgeMemory {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_LIMIT)
    }
}

impl KnowledgeMemory {
    pub fn new(token_limit: usize) -> Self {
        Self {
            items: Vec::new(),
            token_limit,
        }
    }

    /// Whether `text` is non-empty, under the token ceiling and not a refusal.
    pub fn accepts(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        let lower = text.to_lowercase();
        if REJECT_PHRASES.iter().any(|p| lower.contains(p)) {
            return false;
        }
        count_tokens(text) < self.token_limit
    }

    /// Append every candidate that passes [`accepts`](Self::accepts).
    /// Returns how many were stored.
    pub fn update<I>(&mut self, candidates: I) -> usize
    where
        I: IntoIterator<Item = KnowledgeItem>,
    {
        let before = self.items.len();
        for candidate in candidates {
            if self.accepts(&candidate.text) {
                self.items.push(candidate);
            }
        }
        self.items.len() - before
    }

    /// All items, each wrapped in `<knowledge>` tags, separated by a blank line.
    pub fn retrieve(&self) -> String {
        self.items
            .iter()
            .map(|item| format!("<knowledge>\n{}\n</knowledge>", item.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn reset(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> &[KnowledgeItem] {
        &self.items
    }

    pub fn texts(&self) -> Vec<String> {
        self.items.iter().map(|i| i.text.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Collapse near-duplicate items. `embeddings[i]` belongs to item `i`; when
    /// the lengths disagree nothing is removed. Returns how many were dropped.
    pub fn dedup(&mut self, embeddings: Vec<Vec<f32>>, threshold: f32) -> usize {
        if embeddings.len() != self.items.len() {
            tracing::warn!(
                items = self.items.len(),
                embeddings = embeddings.len(),
                "knowledge dedup skipped: embedding count mismatch"
            );
            return 0;
        }
        let before = self.items.len();
        let paired: Vec<Paired> = std::mem::take(&mut self.items)
            .into_iter()
            .zip(embeddings)
            .map(|(item, embedding)| Paired { item, embedding })
            .collect();
        self.items = similarity::dedup(paired, threshold)
            .into_iter()
            .map(|p| p.item)
            .collect();
        before - self.items.len()
    }
}

struct Paired {
    item: KnowledgeItem,
    embedding: Vec<f32>,
}

impl Embedded for Paired {
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(text: &str) -> KnowledgeItem {
        KnowledgeItem::new(text, Some(1))
    }

    #[test]
    fn update_filters_empty_refusals_and_oversized() {
        let mut memory = KnowledgeMemory::new(50);
        let long = "torque ".repeat(200);
        let stored = memory.update(vec![
            item("The relief valve opens at 12 bar."),
            item("   "),
            item("Sorry, I can't find that."),
            item("The provided text does not contain pump data."),
            item(&long),
            item("Replace the filter every 500 hours."),
        ]);
        assert_eq!(stored, 2);
        assert_eq!(
            memory.texts(),
            vec![
                "The relief valve opens at 12 bar.".to_string(),
                "Replace the filter every 500 hours.".to_string()
            ]
        );
    }

    #[test]
    fn retrieve_wraps_each_item() {
        let mut memory = KnowledgeMemory::default();
        memory.update(vec![item("first"), item("second")]);
        assert_eq!(
            memory.retrieve(),
            "<knowledge>\nfirst\n</knowledge>\n\n<knowledge>\nsecond\n</knowledge>"
        );
    }

    #[test]
    fn empty_memory_renders_empty_string() {
        let memory = KnowledgeMemory::default();
        assert!(memory.is_empty());
        assert_eq!(memory.retrieve(), "");
    }

    #[test]
    fn reset_clears_items() {
        let mut memory = KnowledgeMemory::default();
        memory.update(vec![item("kept")]);
        memory.reset();
        assert!(memory.is_empty());
    }

    #[test]
    fn dedup_keeps_first_of_similar_items() {
        let mut memory = KnowledgeMemory::default();
        memory.update(vec![item("a"), item("a, reworded"), item("b")]);
        let removed = memory.dedup(
            vec![vec![1.0, 0.0], vec![0.99, 0.05], vec![0.0, 1.0]],
            0.85,
        );
        assert_eq!(removed, 1);
        assert_eq!(memory.texts(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn dedup_with_mismatched_embeddings_is_a_no_op() {
        let mut memory = KnowledgeMemory::default();
        memory.update(vec![item("a"), item("b")]);
        assert_eq!(memory.dedup(vec![vec![1.0]], 0.85), 0);
        assert_eq!(memory.len(), 2);
    }
}
