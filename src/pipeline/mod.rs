//! Answer pipeline for one question.
//!
//! Stages, in order:
//! 1. **Select** the document to search (optional)
//! 2. **Rewrite** the question into search queries
//! 3. **Retrieve** chunks per query, dropping near-duplicates of anything seen
//! 4. **Extract** knowledge per chunk into [`KnowledgeMemory`](crate::memory::KnowledgeMemory)
//! 5. **Decide** whether the knowledge suffices
//! 6. **Answer**, falling back to a concise draft
//! 7. **Fill** sections the draft refers to but does not contain
//! 8. **Evaluate/improve**, bounded by `max_refinements`
//! 9. **Attribute** statements to source pages and resolve image references
//!
//! Fan-out stages only return values; the state is written here after each
//! batch completes. Isolated failures are logged and dropped. The only error
//! that leaves [`Pipeline::run`] is a failure of both answer drafts.

pub mod state;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::action_log::{ActionSink, NoopActionSink};
use crate::agents::{AgentError, AgentModels, AgentRunner, AgentSettings, Decision, MissingSection};
use crate::citation::{Attributor, Citation, EmbeddingAttributor, FactCheckAttributor};
use crate::config::{AttributionMode, ConfigError, PipelineConfig};
use crate::fanout::FanOut;
use crate::gateway::{Attribution, ChatGateway, EmbedGateway, EmbedModel, EmbedRequest};
use crate::images::ImageIntegrator;
use crate::memory::KnowledgeItem;
use crate::narration::{Narration, NoopStatusSink, Stage, StatusSink};
use crate::similarity::{dedup_against_seen, is_represented};
use crate::vector_store::{
    DocumentMetadata, RetrievedChunk, VectorQuery, VectorStore, VectorStoreError,
};

use state::{page_of, TallySink};
pub use state::{PipelineState, RunUsage};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("answer drafting failed ({primary}); concise fallback failed ({fallback})")]
    Answer {
        primary: AgentError,
        fallback: AgentError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Final answer plus a report of how it was produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub request_id: Uuid,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub decision: Option<Decision>,
    /// Improvements applied by the evaluate/improve loop.
    pub refinements: u32,
    /// Whether the evaluator approved the returned answer.
    pub approved: bool,
    /// Whether the concise fallback produced the draft.
    pub concise: bool,
    pub knowledge_items: usize,
    pub attributed: bool,
    pub usage: RunUsage,
}

/// One gap's retrieval and extraction.
#[derive(Debug)]
struct GapHarvest {
    chunks: Vec<RetrievedChunk>,
    /// Chunk index and the knowledge drawn from it.
    items: Vec<(usize, KnowledgeItem)>,
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct Pipeline {
    config: PipelineConfig,
    chat: Arc<dyn ChatGateway>,
    embed: Arc<dyn EmbedGateway>,
    store: Arc<dyn VectorStore>,
    status: Arc<dyn StatusSink>,
    actions: Arc<dyn ActionSink>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        chat: Arc<dyn ChatGateway>,
        embed: Arc<dyn EmbedGateway>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            chat,
            embed,
            store,
            status: Arc::new(NoopStatusSink),
            actions: Arc::new(NoopActionSink),
        })
    }

    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_action_sink(mut self, actions: Arc<dyn ActionSink>) -> Self {
        self.actions = actions;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, question: &str) -> Result<PipelineOutput, PipelineError> {
        self.run_with_id(question, Uuid::new_v4()).await
    }

    /// Run under a caller-chosen request id, which keys every action record.
    pub async fn run_with_id(
        &self,
        question: &str,
        request_id: Uuid,
    ) -> Result<PipelineOutput, PipelineError> {
        let span = info_span!("answer_request", request_id = %request_id);
        self.execute(question, request_id).instrument(span).await
    }

    async fn execute(
        &self,
        question: &str,
        request_id: Uuid,
    ) -> Result<PipelineOutput, PipelineError> {
        let tally = Arc::new(TallySink::new(self.actions.clone()));
        let agents = AgentRunner::new(
            self.chat.clone(),
            tally.clone(),
            AgentModels {
                reasoning: self.config.model.clone(),
                answer: self.config.answer_model.clone(),
            },
            request_id,
        );
        let mut state = PipelineState::new(request_id, self.config.knowledge_token_limit);
        self.status.narrate(&Narration::SearchStarted);

        if self.config.select_document {
            let document = self.select_document(&agents, &mut state, question).await;
            state.document = document;
        }

        // Rewrite
        state.enter(Stage::QueryRefine);
        let queries = self.rewrite(&agents, question, state.summary()).await;
        self.status.narrate(&Narration::QueriesRewritten {
            count: queries.len(),
        });

        // Retrieve
        state.enter(Stage::ChunkRetrieve);
        let search: Vec<VectorQuery> = queries
            .iter()
            .map(|q| VectorQuery::new(q.as_str(), self.config.retrieval_k).in_document(state.filename()))
            .collect();
        let chunks = self.retrieve(&search, &state.seen).await;
        self.status.narrate(&Narration::ChunksRetrieved {
            count: chunks.len(),
        });

        // Extract
        state.enter(Stage::KnowledgeExtract);
        let items = self.extract(&agents, question, &chunks).await;
        let added = state.admit(&chunks, items);
        self.status
            .narrate(&Narration::KnowledgeExtracted { count: added });
        self.dedup_knowledge(&mut state).await;

        // Decide
        state.enter(Stage::Decide);
        match agents.decide(question, &state.memory.retrieve()).await {
            Ok(decision) => {
                if decision == Decision::Reflect {
                    info!("reflect requested; continuing on the answer path");
                }
                state.decision = Some(decision);
                self.status.narrate(&Narration::Decided { decision });
            }
            Err(e) => warn!(error = %e, "decision failed; continuing on the answer path"),
        }

        // Answer
        state.enter(Stage::AnswerGenerate);
        let mut answer = self.draft(&agents, &mut state, question).await?;
        self.status.narrate(&Narration::AnswerDrafted {
            concise: state.concise,
        });

        if self.config.fill_missing_sections {
            answer = self
                .fill_missing_sections(&agents, &mut state, question, answer)
                .await;
        }

        let answer = self.refine(&agents, &mut state, question, answer).await;
        let (answer, citations, attributed) = self.finish(&agents, &mut state, answer).await;

        state.enter(Stage::Done);
        self.status.narrate(&Narration::Finished);
        info!(
            knowledge = state.memory.len(),
            refinements = state.refinements,
            approved = state.approved,
            citations = citations.len(),
            "request complete"
        );

        Ok(PipelineOutput {
            request_id,
            answer,
            citations,
            decision: state.decision,
            refinements: state.refinements,
            approved: state.approved,
            concise: state.concise,
            knowledge_items: state.memory.len(),
            attributed,
            usage: tally.usage(),
        })
    }

    // =========================================================================
    // Stages
    // =========================================================================

    async fn select_document(
        &self,
        agents: &AgentRunner,
        state: &mut PipelineState,
        question: &str,
    ) -> Option<DocumentMetadata> {
        state.enter(Stage::MetadataExtract);
        let mut documents = match self.store.metadata().await {
            Ok(documents) => documents,
            Err(e) => {
                warn!(error = %e, "document listing failed; searching all documents");
                return None;
            }
        };
        self.status.narrate(&Narration::DocumentsListed {
            count: documents.len(),
        });

        state.enter(Stage::DocSelect);
        let chosen = match documents.len() {
            0 => None,
            1 => documents.pop(),
            _ => match agents.select_document(question, &documents).await {
                Ok(filename) => {
                    let found = documents.iter().position(|d| d.filename == filename);
                    if found.is_none() {
                        warn!(%filename, "selected document is not in the store; searching all documents");
                    }
                    found.map(|idx| documents.swap_remove(idx))
                }
                Err(e) => {
                    warn!(error = %e, "document selection failed; searching all documents");
                    None
                }
            },
        };
        if let Some(doc) = &chosen {
            self.status.narrate(&Narration::DocumentSelected {
                filename: doc.filename.clone(),
            });
        }
        chosen
    }

    /// Rewritten queries capped at `max_rewrites`, original query last.
    async fn rewrite(&self, agents: &AgentRunner, question: &str, summary: Option<&str>) -> Vec<String> {
        match agents.rewrite_query(question, summary).await {
            Ok(mut queries) => {
                let original = queries.pop();
                queries.truncate(self.config.max_rewrites);
                queries.extend(original);
                queries
            }
            Err(e) => {
                warn!(error = %e, "query rewrite failed; searching with the original question");
                vec![question.trim().to_string()]
            }
        }
    }

    async fn retrieve(&self, queries: &[VectorQuery], seen: &[Vec<f32>]) -> Vec<RetrievedChunk> {
        let fan = FanOut::new("retrieve", self.config.retrieval_concurrency);
        let batches: Vec<Vec<RetrievedChunk>> = fan
            .ordered(queries.iter().map(|q| self.store.query(q)))
            .await;
        let chunks: Vec<RetrievedChunk> = batches.into_iter().flatten().collect();
        let total = chunks.len();
        let fresh = dedup_against_seen(chunks, seen, self.config.retrieval_dedup_threshold);
        debug!(total, fresh = fresh.len(), "retrieved chunks deduplicated");
        fresh
    }

    /// Knowledge per chunk, paired with the chunk's index. A chunk whose
    /// output is malformed gets one more try with compressed extraction.
    async fn extract(
        &self,
        agents: &AgentRunner,
        question: &str,
        chunks: &[RetrievedChunk],
    ) -> Vec<(usize, KnowledgeItem)> {
        let fan = FanOut::new("extract", self.config.extraction_concurrency);
        let mut results = fan
            .results(
                chunks
                    .iter()
                    .map(|c| agents.extract_knowledge(question, &c.text, AgentSettings::default())),
            )
            .await;

        let malformed: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.as_ref().is_err_and(AgentError::is_schema))
            .map(|(idx, _)| idx)
            .collect();
        if !malformed.is_empty() {
            info!(chunks = malformed.len(), "malformed extraction output; retrying with compressed extraction");
            let retried = fan
                .results(malformed.iter().map(|&idx| {
                    agents.extract_knowledge(question, &chunks[idx].text, AgentSettings::compressed())
                }))
                .await;
            for (idx, result) in malformed.into_iter().zip(retried) {
                results[idx] = result;
            }
        }

        let mut items = Vec::new();
        for (idx, (chunk, result)) in chunks.iter().zip(results).enumerate() {
            let text = match result {
                Ok(text) => text,
                Err(e) => {
                    warn!(stage = "extract", chunk = idx, error = %e, "extraction failed");
                    if !self.config.degrade_failed_extraction {
                        continue;
                    }
                    chunk.text.clone()
                }
            };
            items.push((idx, KnowledgeItem::new(text, page_of(chunk))));
        }
        items
    }

    fn embed_model(&self) -> EmbedModel {
        EmbedModel::from_id(&self.config.embedding_model)
    }

    async fn dedup_knowledge(&self, state: &mut PipelineState) {
        if state.memory.len() < 2 {
            return;
        }
        let req = EmbedRequest::new(
            self.embed_model(),
            state.memory.texts(),
            Attribution::new("pipeline::knowledge_dedup").with_request(state.request_id),
        );
        match self.embed.embed(req).await {
            Ok(resp) => {
                let dropped = state
                    .memory
                    .dedup(resp.embeddings, self.config.knowledge_dedup_threshold);
                if dropped > 0 {
                    debug!(dropped, "near-duplicate knowledge removed");
                }
            }
            Err(e) => warn!(error = %e, "knowledge embedding failed; dedup skipped"),
        }
    }

    /// Draft from the current knowledge, falling back to the concise variant.
    async fn draft(
        &self,
        agents: &AgentRunner,
        state: &mut PipelineState,
        question: &str,
    ) -> Result<String, PipelineError> {
        let knowledge = state.memory.retrieve();
        match agents.answer(question, &knowledge).await {
            Ok(answer) => {
                state.concise = false;
                Ok(answer)
            }
            Err(primary) => {
                warn!(error = %primary, "answer drafting failed; trying concise variant");
                match agents.concise_answer(question, &knowledge).await {
                    Ok(answer) => {
                        state.concise = true;
                        Ok(answer)
                    }
                    Err(fallback) => Err(PipelineError::Answer { primary, fallback }),
                }
            }
        }
    }

    async fn fill_missing_sections(
        &self,
        agents: &AgentRunner,
        state: &mut PipelineState,
        question: &str,
        answer: String,
    ) -> String {
        state.enter(Stage::GapFill);
        let sections = match agents.missing_info(&answer, state.summary()).await {
            Ok(sections) => sections,
            Err(e) => {
                warn!(error = %e, "missing-section scan failed; keeping draft");
                return answer;
            }
        };
        if sections.is_empty() {
            self.status
                .narrate(&Narration::GapsFilled { gaps: 0, added: 0 });
            return answer;
        }
        state.gap_fill_attempted = true;

        let harvests = self.gap_batch(agents, state, question, &sections).await;
        let mut added = 0;
        for harvest in harvests {
            added += self.admit_gap(state, harvest);
        }
        self.status.narrate(&Narration::GapsFilled {
            gaps: sections.len(),
            added,
        });
        if added == 0 {
            return answer;
        }

        self.dedup_knowledge(state).await;
        match self.draft(agents, state, question).await {
            Ok(redrafted) => redrafted,
            Err(e) => {
                warn!(error = %e, "redraft after gap fill failed; keeping previous draft");
                answer
            }
        }
    }

    async fn gap_batch(
        &self,
        agents: &AgentRunner,
        state: &PipelineState,
        question: &str,
        sections: &[MissingSection],
    ) -> Vec<GapHarvest> {
        let fan = FanOut::new("gap_fill", self.config.gap_concurrency);
        let filename = state.filename();
        fan.ordered(
            sections
                .iter()
                .map(|s| self.fill_gap(agents, question, s, filename, &state.seen)),
        )
        .await
    }

    async fn fill_gap(
        &self,
        agents: &AgentRunner,
        question: &str,
        section: &MissingSection,
        filename: Option<&str>,
        seen: &[Vec<f32>],
    ) -> Result<GapHarvest, VectorStoreError> {
        let query = VectorQuery::new(section.extraction_query.as_str(), self.config.retrieval_k)
            .in_document(filename)
            .in_section(section.referenced_section.as_str());
        let chunks = self.store.query(&query).await?;
        let chunks = dedup_against_seen(chunks, seen, self.config.retrieval_dedup_threshold);
        let items = self.extract(agents, question, &chunks).await;
        Ok(GapHarvest { chunks, items })
    }

    /// Admit a gap's chunks that earlier gaps have not already covered.
    fn admit_gap(&self, state: &mut PipelineState, harvest: GapHarvest) -> usize {
        let threshold = self.config.retrieval_dedup_threshold;
        let mut remap = vec![None; harvest.chunks.len()];
        let mut kept = Vec::with_capacity(harvest.chunks.len());
        for (idx, chunk) in harvest.chunks.into_iter().enumerate() {
            if !is_represented(&chunk.embedding, &state.seen, threshold) {
                remap[idx] = Some(kept.len());
                kept.push(chunk);
            }
        }
        let items = harvest
            .items
            .into_iter()
            .filter_map(|(idx, item)| remap.get(idx).copied().flatten().map(|j| (j, item)))
            .collect();
        state.admit(&kept, items)
    }

    /// Evaluate first; improve only a rejected answer. Stops at the bound.
    async fn refine(
        &self,
        agents: &AgentRunner,
        state: &mut PipelineState,
        question: &str,
        mut answer: String,
    ) -> String {
        for iteration in 1..=self.config.max_refinements {
            state.enter(Stage::AnswerEvaluate);
            let knowledge = state.memory.retrieve();
            let evaluation = match agents.evaluate(question, &knowledge, &answer).await {
                Ok(evaluation) => evaluation,
                Err(e) => {
                    warn!(iteration, error = %e, "evaluation failed; keeping current answer");
                    break;
                }
            };
            self.status.narrate(&Narration::Evaluated {
                iteration,
                approved: evaluation.approved(),
            });
            if evaluation.approved() {
                state.approved = true;
                break;
            }

            state.enter(Stage::AnswerRefine);
            match agents
                .improve(question, &answer, &evaluation.improvement_areas, &knowledge)
                .await
            {
                Ok(improved) if !improved.trim().is_empty() => {
                    answer = improved;
                    state.refinements += 1;
                    self.status.narrate(&Narration::Improved { iteration });
                }
                Ok(_) => {
                    warn!(iteration, "improver returned an empty answer; keeping current answer");
                    break;
                }
                Err(e) => {
                    warn!(iteration, error = %e, "improvement failed; keeping current answer");
                    break;
                }
            }
        }
        answer
    }

    /// Resolve image references, then attribute. Never fails.
    async fn finish(
        &self,
        agents: &AgentRunner,
        state: &mut PipelineState,
        mut answer: String,
    ) -> (String, Vec<Citation>, bool) {
        if self.config.integrate_images {
            answer = ImageIntegrator::new(agents.clone(), self.config.verification_concurrency)
                .integrate(&answer, state.memory.items())
                .await;
        }

        state.enter(Stage::Attribute);
        let attributor: Box<dyn Attributor> = match self.config.attribution {
            AttributionMode::Embedding => Box::new(EmbeddingAttributor::new(
                self.embed.clone(),
                self.embed_model(),
                self.config.citation_threshold,
                self.config.citation_min_length,
            )
            .with_page_concurrency(self.config.verification_concurrency)),
            AttributionMode::FactCheck => Box::new(FactCheckAttributor::new(
                agents.clone(),
                self.config.citation_min_length,
                self.config.verification_concurrency,
            )),
            AttributionMode::None => return (answer, Vec::new(), false),
        };

        let pages = state.source_pages();
        match attributor.attribute(&answer, &pages, state.request_id).await {
            Ok(attributed) => {
                self.status.narrate(&Narration::Attributed {
                    citations: attributed.citations.len(),
                });
                let cited = !attributed.citations.is_empty();
                (attributed.text, attributed.citations, cited)
            }
            Err(e) => {
                warn!(error = %e, "attribution failed; returning unattributed answer");
                (answer, Vec::new(), false)
            }
        }
    }
}
