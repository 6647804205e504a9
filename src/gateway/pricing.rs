//! Per-token prices for the models the pipeline talks to.
//!
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Input/output price for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// Embeddings
// text-embedding-3-large: $0.13/1M tokens
// text-embedding-3-small: $0.02/1M tokens
const EMBED_3_LARGE: ModelPricing = ModelPricing::new(130, 0);
const EMBED_3_SMALL: ModelPricing = ModelPricing::new(20, 0);

// Chat via OpenRouter (check the model pages when these drift)
// Gemini 2.0 Flash: $0.10/1M input, $0.40/1M output
const GEMINI_20_FLASH: ModelPricing = ModelPricing::new(100, 400);
// Gemini 2.5 Flash: $0.30/1M input, $2.50/1M output
const GEMINI_25_FLASH: ModelPricing = ModelPricing::new(300, 2_500);
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600);
// GPT-4.1-mini: $0.40/1M input, $1.60/1M output
const GPT_41_MINI: ModelPricing = ModelPricing::new(400, 1_600);
// Claude 3.5 Haiku: $0.80/1M input, $4.00/1M output
const CLAUDE_35_HAIKU: ModelPricing = ModelPricing::new(800, 4_000);

/// Unknown chat models are billed as a mid-range model.
const CHAT_FALLBACK: ModelPricing = ModelPricing::new(1_000, 5_000);

static PRICING: Lazy<HashMap<&'static str, ModelPricing>> = Lazy::new(|| {
    HashMap::from([
        ("text-embedding-3-large", EMBED_3_LARGE),
        ("text-embedding-3-small", EMBED_3_SMALL),
        ("google/gemini-2.0-flash-001", GEMINI_20_FLASH),
        ("google/gemini-2.5-flash", GEMINI_25_FLASH),
        ("openai/gpt-4o-mini", GPT_4O_MINI),
        ("openai/gpt-4.1-mini", GPT_41_MINI),
        ("anthropic/claude-3-5-haiku", CLAUDE_35_HAIKU),
    ])
});

pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    PRICING.get(model_id).copied()
}

/// Embedding cost; unknown models are priced like `text-embedding-3-large`.
pub fn embedding_cost(model: &str, tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(EMBED_3_LARGE)
        .calculate_cost(tokens, 0)
}

pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(CHAT_FALLBACK)
        .calculate_cost(input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_cost() {
        // 1M tokens at $0.02/1M = 20,000,000 nanodollars
        assert_eq!(embedding_cost("text-embedding-3-small", 1_000_000), 20_000_000);
        assert_eq!(embedding_cost("nomic-embed-text", 1_000), 130_000);
    }

    #[test]
    fn test_chat_cost() {
        // Input: 1000 * 100 = 100,000; Output: 1000 * 400 = 400,000
        assert_eq!(chat_cost("google/gemini-2.0-flash-001", 1_000, 1_000), 500_000);
        assert_eq!(chat_cost("someone/unlisted", 1, 1), 6_000);
    }
}
