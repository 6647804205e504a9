//! Request and response shapes shared by every agent and embedding call.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Who asked for a provider call.
///
/// `caller` is a static path such as `"agent::decide"` or
/// `"citation::segments"`; `request_id` ties the call to one answer run so
/// usage can be totalled per question.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    pub request_id: Option<Uuid>,
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            request_id: None,
            caller,
        }
    }

    pub fn with_request(self, request_id: Uuid) -> Self {
        Self {
            request_id: Some(request_id),
            ..self
        }
    }
}

// -----------------------------------------------------------------------------
// Chat
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Instructions for an agent, sent ahead of its input.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Agent input: the question, a document chunk, a draft answer.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Model routed through OpenRouter, named by its slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatModel {
    OpenRouter(String),
}

impl ChatModel {
    pub fn openrouter(slug: impl Into<String>) -> Self {
        Self::OpenRouter(slug.into())
    }

    pub fn model_id(&self) -> &str {
        let Self::OpenRouter(slug) = self;
        slug
    }

    pub fn provider(&self) -> &'static str {
        "openrouter"
    }
}

/// One agent call. Built with [`ChatRequest::new`] and refined with the
/// builder methods; temperature defaults to zero.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: ChatModel,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            json_mode: false,
            attribution,
        }
    }

    pub fn temperature(self, temperature: f32) -> Self {
        Self {
            temperature,
            ..self
        }
    }

    pub fn max_tokens(self, max: u32) -> Self {
        Self {
            max_tokens: Some(max),
            ..self
        }
    }

    pub fn json(self) -> Self {
        Self {
            json_mode: true,
            ..self
        }
    }

    /// Everything the agent was given, minus its instructions. Hashed into
    /// the action log and shown in narration.
    pub fn user_text(&self) -> String {
        let mut out = String::new();
        for message in self.messages.iter().filter(|m| m.role == Role::User) {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&message.content);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(reason: Option<String>) -> Self {
        let Some(reason) = reason else {
            return Self::Unknown("none".to_string());
        };
        match reason.as_str() {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "tool_calls" => Self::ToolCalls,
            _ => Self::Unknown(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Priced locally from the token counts.
    pub cost_nanodollars: i64,
    /// What OpenRouter reported paying upstream, when it says.
    pub upstream_cost_nanodollars: Option<i64>,
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

// -----------------------------------------------------------------------------
// Embeddings
// -----------------------------------------------------------------------------

/// Embedding model served by an OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedModel {
    OpenAI3Large,
    OpenAI3Small,
    Custom(String),
}

const LARGE_ID: &str = "text-embedding-3-large";
const SMALL_ID: &str = "text-embedding-3-small";

impl EmbedModel {
    pub fn from_id(id: &str) -> Self {
        if id == LARGE_ID {
            Self::OpenAI3Large
        } else if id == SMALL_ID {
            Self::OpenAI3Small
        } else {
            Self::Custom(id.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::OpenAI3Large => LARGE_ID,
            Self::OpenAI3Small => SMALL_ID,
            Self::Custom(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        "openai"
    }
}

/// Texts to embed in one call; the response holds one vector per text.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub model: EmbedModel,
    pub texts: Vec<String>,
    pub attribution: Attribution,
}

impl EmbedRequest {
    pub fn new(model: EmbedModel, texts: Vec<String>, attribution: Attribution) -> Self {
        Self {
            model,
            texts,
            attribution,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbedResponse {
    /// In input order.
    pub embeddings: Vec<Vec<f32>>,
    pub tokens: u32,
    pub cost_nanodollars: i64,
    pub latency: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_finish_reason_keeps_provider_string() {
        assert_eq!(FinishReason::from(Some("stop".into())), FinishReason::Stop);
        assert_eq!(
            FinishReason::from(Some("eos".into())),
            FinishReason::Unknown("eos".to_string())
        );
        assert_eq!(
            FinishReason::from(None),
            FinishReason::Unknown("none".to_string())
        );
    }

    #[test]
    fn user_text_joins_inputs_without_instructions() {
        let req = ChatRequest::new(
            ChatModel::openrouter("test/model"),
            vec![
                Message::system("rules"),
                Message::user("question"),
                Message::user("chunk"),
            ],
            Attribution::new("test"),
        );
        assert_eq!(req.user_text(), "question\nchunk");
        assert!(!req.json_mode);
        assert!(req.json().json_mode);
    }

    #[test]
    fn embed_model_ids() {
        assert_eq!(EmbedModel::from_id(SMALL_ID), EmbedModel::OpenAI3Small);
        assert_eq!(EmbedModel::OpenAI3Large.as_str(), LARGE_ID);
        assert_eq!(
            EmbedModel::from_id("nomic-embed-text").as_str(),
            "nomic-embed-text"
        );
    }
}
