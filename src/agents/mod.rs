//! Agent contract: one call to the reasoning service with a declared output
//! schema.
//!
//! [`AgentRunner::perform`] renders the messages, requests JSON, extracts the
//! first balanced object from the reply and deserialises it. Each call leaves
//! one [`ActionRecord`](crate::action_log::ActionRecord) in the injected sink.
//! Prompt wording lives in [`crate::prompts`].

pub mod json;
pub mod schemas;

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::action_log::{hash_input, now_epoch_ms, ActionOutcome, ActionRecord, ActionSink};
use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, ChatResponse, Message, ProviderError,
};
use crate::prompts;
use crate::vector_store::DocumentMetadata;

pub use json::extract_json;
pub use schemas::*;

// =============================================================================
// Actions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    SelectDocument,
    RewriteQuery,
    ExtractKnowledge,
    Decide,
    Answer,
    ConciseAnswer,
    MissingInfo,
    Evaluate,
    Improve,
    VerifyFact,
    LocateImage,
}

impl AgentAction {
    pub const ALL: &'static [AgentAction] = &[
        AgentAction::SelectDocument,
        AgentAction::RewriteQuery,
        AgentAction::ExtractKnowledge,
        AgentAction::Decide,
        AgentAction::Answer,
        AgentAction::ConciseAnswer,
        AgentAction::MissingInfo,
        AgentAction::Evaluate,
        AgentAction::Improve,
        AgentAction::VerifyFact,
        AgentAction::LocateImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentAction::SelectDocument => "select_document",
            AgentAction::RewriteQuery => "rewrite_query",
            AgentAction::ExtractKnowledge => "extract_knowledge",
            AgentAction::Decide => "decide",
            AgentAction::Answer => "answer",
            AgentAction::ConciseAnswer => "concise_answer",
            AgentAction::MissingInfo => "missing_info",
            AgentAction::Evaluate => "evaluate",
            AgentAction::Improve => "improve",
            AgentAction::VerifyFact => "verify_fact",
            AgentAction::LocateImage => "locate_image",
        }
    }

    /// Attribution caller string for gateway usage records.
    pub fn caller(&self) -> &'static str {
        match self {
            AgentAction::SelectDocument => "agent::select_document",
            AgentAction::RewriteQuery => "agent::rewrite_query",
            AgentAction::ExtractKnowledge => "agent::extract_knowledge",
            AgentAction::Decide => "agent::decide",
            AgentAction::Answer => "agent::answer",
            AgentAction::ConciseAnswer => "agent::concise_answer",
            AgentAction::MissingInfo => "agent::missing_info",
            AgentAction::Evaluate => "agent::evaluate",
            AgentAction::Improve => "agent::improve",
            AgentAction::VerifyFact => "agent::verify_fact",
            AgentAction::LocateImage => "agent::locate_image",
        }
    }

    /// Drafting actions run on the answer model; everything else on the
    /// reasoning model.
    fn drafts_answer(&self) -> bool {
        matches!(
            self,
            AgentAction::Answer | AgentAction::ConciseAnswer | AgentAction::Improve
        )
    }

    fn default_temperature(&self) -> f32 {
        match self {
            AgentAction::Answer
            | AgentAction::ConciseAnswer
            | AgentAction::Improve
            | AgentAction::RewriteQuery => 0.6,
            _ => 0.0,
        }
    }
}

// =============================================================================
// Errors and usage
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("{} returned output that does not match its schema: {message}", action.as_str())]
    Schema {
        action: AgentAction,
        message: String,
    },
}

impl AgentError {
    pub fn is_schema(&self) -> bool {
        matches!(self, AgentError::Schema { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Provider(e) => e.code(),
            AgentError::Schema { .. } => "schema",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
}

impl From<&ChatResponse> for AgentUsage {
    fn from(resp: &ChatResponse) -> Self {
        Self {
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            cost_nanodollars: resp.cost_nanodollars,
        }
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentSettings {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Stricter extraction prompt with a hard token ceiling.
    pub compressed: bool,
}

impl AgentSettings {
    pub fn compressed() -> Self {
        Self {
            compressed: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentModels {
    /// Selection, rewriting, extraction, decisions, evaluation, verification.
    pub reasoning: String,
    /// Answer drafting and improvement.
    pub answer: String,
}

// =============================================================================
// Runner
// =============================================================================

/// Runs agent actions for one answer request.
#[derive(Clone)]
pub struct AgentRunner {
    gateway: Arc<dyn ChatGateway>,
    actions: Arc<dyn ActionSink>,
    models: AgentModels,
    request_id: Uuid,
}

impl AgentRunner {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        actions: Arc<dyn ActionSink>,
        models: AgentModels,
        request_id: Uuid,
    ) -> Self {
        Self {
            gateway,
            actions,
            models,
            request_id,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Structured call: the reply must contain a JSON object matching `T`.
    pub async fn perform<T: DeserializeOwned>(
        &self,
        action: AgentAction,
        user: String,
        settings: AgentSettings,
    ) -> Result<(T, AgentUsage), AgentError> {
        let started = Instant::now();
        let input_hash = hash_input(&user);
        let resp = self.send(action, user, settings, true, &input_hash, started).await?;

        match serde_json::from_str::<T>(extract_json(&resp.content)) {
            Ok(parsed) => {
                self.record(action, &input_hash, started, Some(&resp), ActionOutcome::Ok);
                Ok((parsed, AgentUsage::from(&resp)))
            }
            Err(e) => {
                self.record(action, &input_hash, started, Some(&resp), schema_outcome());
                let preview: String = resp.content.chars().take(300).collect();
                Err(AgentError::Schema {
                    action,
                    message: format!("{e}; raw: {preview}"),
                })
            }
        }
    }

    /// Free-text call. An empty reply is a schema failure.
    pub async fn perform_text(
        &self,
        action: AgentAction,
        user: String,
        settings: AgentSettings,
    ) -> Result<(String, AgentUsage), AgentError> {
        let started = Instant::now();
        let input_hash = hash_input(&user);
        let resp = self.send(action, user, settings, false, &input_hash, started).await?;

        if resp.content.trim().is_empty() {
            self.record(action, &input_hash, started, Some(&resp), schema_outcome());
            return Err(AgentError::Schema {
                action,
                message: "empty response".to_string(),
            });
        }
        self.record(action, &input_hash, started, Some(&resp), ActionOutcome::Ok);
        let usage = AgentUsage::from(&resp);
        Ok((resp.content, usage))
    }

    async fn send(
        &self,
        action: AgentAction,
        user: String,
        settings: AgentSettings,
        json: bool,
        input_hash: &str,
        started: Instant,
    ) -> Result<ChatResponse, AgentError> {
        let system = prompts::system_prompt(action, settings.compressed);
        let mut req = ChatRequest::new(
            ChatModel::openrouter(self.model_for(action)),
            vec![Message::system(system), Message::user(user)],
            Attribution::new(action.caller()).with_request(self.request_id),
        )
        .temperature(
            settings
                .temperature
                .unwrap_or_else(|| action.default_temperature()),
        );
        if let Some(max) = settings.max_tokens {
            req = req.max_tokens(max);
        }
        if json {
            req = req.json();
        }

        match self.gateway.chat(req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.record(
                    action,
                    input_hash,
                    started,
                    None,
                    ActionOutcome::Error {
                        code: e.code().to_string(),
                    },
                );
                Err(e.into())
            }
        }
    }

    fn model_for(&self, action: AgentAction) -> &str {
        if action.drafts_answer() {
            &self.models.answer
        } else {
            &self.models.reasoning
        }
    }

    fn record(
        &self,
        action: AgentAction,
        input_hash: &str,
        started: Instant,
        resp: Option<&ChatResponse>,
        outcome: ActionOutcome,
    ) {
        let usage = resp.map(AgentUsage::from).unwrap_or_default();
        let record = ActionRecord {
            request_id: self.request_id,
            timestamp_ms: now_epoch_ms(),
            action,
            model: self.model_for(action).to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_nanodollars: usage.cost_nanodollars,
            input_hash: input_hash.to_string(),
            outcome,
        };
        if let Err(e) = self.actions.record(record) {
            warn!(action = action.as_str(), error = %e, "failed to record agent action");
        }
    }

    // =========================================================================
    // Typed actions
    // =========================================================================

    pub async fn select_document(
        &self,
        query: &str,
        documents: &[DocumentMetadata],
    ) -> Result<String, AgentError> {
        let (choice, _) = self
            .perform::<DocumentChoice>(
                AgentAction::SelectDocument,
                prompts::select_document_message(query, documents),
                AgentSettings::default(),
            )
            .await?;
        Ok(choice.filename.trim().to_string())
    }

    /// Search variants for `query`; the original query is always last.
    pub async fn rewrite_query(
        &self,
        query: &str,
        summary: Option<&str>,
    ) -> Result<Vec<String>, AgentError> {
        let (out, _) = self
            .perform::<RewrittenQueries>(
                AgentAction::RewriteQuery,
                prompts::rewrite_message(query, summary),
                AgentSettings::default(),
            )
            .await?;
        Ok(with_original_query(out.rewritten_queries, query))
    }

    pub async fn extract_knowledge(
        &self,
        query: &str,
        chunk: &str,
        settings: AgentSettings,
    ) -> Result<String, AgentError> {
        let (out, _) = self
            .perform::<ExtractedKnowledge>(
                AgentAction::ExtractKnowledge,
                prompts::extraction_message(query, chunk),
                settings,
            )
            .await?;
        Ok(out.knowledge)
    }

    pub async fn decide(&self, query: &str, knowledge: &str) -> Result<Decision, AgentError> {
        let (out, _) = self
            .perform::<DecisionOutput>(
                AgentAction::Decide,
                prompts::knowledge_message(query, knowledge),
                AgentSettings::default(),
            )
            .await?;
        Ok(out.action)
    }

    pub async fn answer(&self, query: &str, knowledge: &str) -> Result<String, AgentError> {
        let (text, _) = self
            .perform_text(
                AgentAction::Answer,
                prompts::knowledge_message(query, knowledge),
                AgentSettings::default(),
            )
            .await?;
        Ok(text)
    }

    pub async fn concise_answer(&self, query: &str, knowledge: &str) -> Result<String, AgentError> {
        let (out, _) = self
            .perform::<ConciseAnswer>(
                AgentAction::ConciseAnswer,
                prompts::knowledge_message(query, knowledge),
                AgentSettings::default(),
            )
            .await?;
        Ok(out.answer)
    }

    pub async fn missing_info(
        &self,
        answer: &str,
        summary: Option<&str>,
    ) -> Result<Vec<MissingSection>, AgentError> {
        let (out, _) = self
            .perform::<MissingInfo>(
                AgentAction::MissingInfo,
                prompts::missing_info_message(answer, summary),
                AgentSettings::default(),
            )
            .await?;
        Ok(out
            .sections
            .into_iter()
            .filter(|s| !s.extraction_query.trim().is_empty())
            .collect())
    }

    pub async fn evaluate(
        &self,
        query: &str,
        knowledge: &str,
        answer: &str,
    ) -> Result<Evaluation, AgentError> {
        let (out, _) = self
            .perform::<Evaluation>(
                AgentAction::Evaluate,
                prompts::evaluation_message(query, knowledge, answer),
                AgentSettings::default(),
            )
            .await?;
        Ok(out)
    }

    pub async fn improve(
        &self,
        query: &str,
        answer: &str,
        feedback: &str,
        knowledge: &str,
    ) -> Result<String, AgentError> {
        let (out, _) = self
            .perform::<ImprovedAnswer>(
                AgentAction::Improve,
                prompts::improve_message(query, answer, feedback, knowledge),
                AgentSettings::default(),
            )
            .await?;
        Ok(out.improved_answer)
    }

    pub async fn verify_fact(&self, fact: &str, context: &str) -> Result<bool, AgentError> {
        let (out, _) = self
            .perform::<FactVerdict>(
                AgentAction::VerifyFact,
                prompts::verify_message(fact, context),
                AgentSettings::default(),
            )
            .await?;
        Ok(out.confirmed())
    }

    pub async fn locate_image(
        &self,
        alt_text: &str,
        section: &str,
    ) -> Result<ImageLocation, AgentError> {
        let (out, _) = self
            .perform::<ImageLocation>(
                AgentAction::LocateImage,
                prompts::locate_image_message(alt_text, section),
                AgentSettings::default(),
            )
            .await?;
        Ok(out)
    }
}

fn schema_outcome() -> ActionOutcome {
    ActionOutcome::Error {
        code: "schema".to_string(),
    }
}

/// Trim, drop blanks and exact repeats, then append the original query.
fn with_original_query(rewritten: Vec<String>, query: &str) -> Vec<String> {
    let original = query.trim();
    let mut out: Vec<String> = Vec::with_capacity(rewritten.len() + 1);
    for q in rewritten {
        let q = q.trim();
        if !q.is_empty() && q != original && !out.iter().any(|seen| seen == q) {
            out.push(q.to_string());
        }
    }
    out.push(original.to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::MemoryActionSink;
    use crate::gateway::FinishReason;
    use std::sync::Mutex;
    use std::time::Duration;

    struct CannedGateway {
        replies: Mutex<Vec<Result<String, ProviderError>>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl CannedGateway {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ChatGateway for CannedGateway {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.seen.lock().unwrap().push(req);
            let content = self.replies.lock().unwrap().remove(0)?;
            Ok(ChatResponse {
                content,
                input_tokens: 10,
                output_tokens: 5,
                cost_nanodollars: 42,
                upstream_cost_nanodollars: None,
                latency: Duration::from_millis(1),
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn runner(
        gateway: Arc<CannedGateway>,
        sink: Arc<MemoryActionSink>,
    ) -> AgentRunner {
        AgentRunner::new(
            gateway,
            sink,
            AgentModels {
                reasoning: "test/reasoning".into(),
                answer: "test/answer".into(),
            },
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn perform_parses_fenced_json_and_records_action() {
        let gateway = Arc::new(CannedGateway::new(vec![Ok(
            "```json\n{\"action\": \"answer\"}\n```".into(),
        )]));
        let sink = Arc::new(MemoryActionSink::new());
        let agents = runner(gateway.clone(), sink.clone());

        let decision = agents.decide("q", "").await.unwrap();
        assert_eq!(decision, Decision::Answer);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AgentAction::Decide);
        assert_eq!(records[0].outcome, ActionOutcome::Ok);
        assert_eq!(records[0].cost_nanodollars, 42);
        assert_eq!(records[0].request_id, agents.request_id());

        let seen = gateway.seen.lock().unwrap();
        assert!(seen[0].json_mode);
        assert_eq!(seen[0].model.model_id(), "test/reasoning");
        assert_eq!(seen[0].attribution.request_id, Some(agents.request_id()));
    }

    #[tokio::test]
    async fn schema_violation_is_reported_and_logged() {
        let gateway = Arc::new(CannedGateway::new(vec![Ok("not json at all".into())]));
        let sink = Arc::new(MemoryActionSink::new());
        let agents = runner(gateway, sink.clone());

        let err = agents.evaluate("q", "k", "a").await.unwrap_err();
        assert!(err.is_schema());
        assert_eq!(err.code(), "schema");
        assert_eq!(
            sink.records()[0].outcome,
            ActionOutcome::Error {
                code: "schema".into()
            }
        );
    }

    #[tokio::test]
    async fn provider_failure_is_logged_with_its_code() {
        let gateway = Arc::new(CannedGateway::new(vec![Err(ProviderError::Timeout(
            Duration::from_secs(1),
        ))]));
        let sink = Arc::new(MemoryActionSink::new());
        let agents = runner(gateway, sink.clone());

        let err = agents.answer("q", "k").await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
        assert_eq!(
            sink.records()[0].outcome,
            ActionOutcome::Error {
                code: "timeout".into()
            }
        );
    }

    #[tokio::test]
    async fn drafting_actions_use_the_answer_model() {
        let gateway = Arc::new(CannedGateway::new(vec![Ok("Drafted answer.".into())]));
        let sink = Arc::new(MemoryActionSink::new());
        let agents = runner(gateway.clone(), sink);

        assert_eq!(agents.answer("q", "k").await.unwrap(), "Drafted answer.");
        let seen = gateway.seen.lock().unwrap();
        assert_eq!(seen[0].model.model_id(), "test/answer");
        assert!(!seen[0].json_mode);
    }

    #[tokio::test]
    async fn empty_text_answer_is_a_schema_error() {
        let gateway = Arc::new(CannedGateway::new(vec![Ok("   ".into())]));
        let agents = runner(gateway, Arc::new(MemoryActionSink::new()));
        assert!(agents.answer("q", "k").await.unwrap_err().is_schema());
    }

    #[test]
    fn original_query_is_appended_once() {
        let out = with_original_query(
            vec![
                " pump pressure ".into(),
                "".into(),
                "pump pressure".into(),
                "What is the pressure?".into(),
            ],
            "What is the pressure?",
        );
        assert_eq!(out, vec!["pump pressure", "What is the pressure?"]);
    }
}
