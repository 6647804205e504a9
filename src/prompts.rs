//! Prompt templates for the pipeline's agents.
//!
//! System prompts are fixed per action. User messages are assembled from
//! tagged sections; the user's question and model-written feedback are
//! XML-escaped so they cannot close a tag early.

use std::borrow::Cow;

use crate::agents::AgentAction;
use crate::vector_store::DocumentMetadata;

// =============================================================================
// Escaping
// =============================================================================

/// Escape XML special characters to prevent prompt injection via tag breaking.
pub fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn tagged(tag: &str, body: &str) -> String {
    format!("<{tag}>\n{}\n</{tag}>", body.trim())
}

// =============================================================================
// System prompts
// =============================================================================

const SELECT_DOCUMENT: &str = r#"You pick the single document most likely to answer the user's query, using each document's summary.
Return only JSON: {"filename": "<one of the listed filenames>"}"#;

const REWRITE_QUERY: &str = r#"You rewrite a user's question into 3-5 focused search queries for a technical document store. Use the document summary to match its vocabulary. Each query must stand alone.
Return only JSON: {"rewritten_queries": ["...", "..."]}"#;

const EXTRACT_KNOWLEDGE: &str = r#"You extract every fact from the document chunk that helps answer the user query. Quote values, units, part numbers, steps and image markup exactly. Keep list and table structure. If nothing in the chunk is relevant, return an empty string.
Return only JSON: {"knowledge": "..."}"#;

const COMPRESSION_SUFFIX: &str =
    "\n\nCompress the information, it must not exceed 4000 tokens. This is a hard limit.";

const DECIDE: &str = r#"You decide whether the collected knowledge is enough to answer the query. Answer "answer" when it covers the specific equipment and question, "reflect" when important parts are missing.
Return only JSON: {"action": "answer" | "reflect"}"#;

const ANSWER: &str = r#"You answer the user query using only the knowledge provided. Write markdown with headings, numbered steps and tables where they help. Keep image markup exactly as it appears in the knowledge. Do not add links, chunk references or facts that are not in the knowledge."#;

const CONCISE_ANSWER: &str = r#"You answer the user query briefly using only the knowledge provided. Prefer the most specific facts; omit background.
Return only JSON: {"answer": "<markdown answer>"}"#;

const MISSING_INFO: &str = r#"You read a drafted answer and list every section of the source document it refers to without including its content (for example "see section 4.2"). For each, give the referenced section and a search query that would retrieve it. Return an empty list when nothing is missing.
Return only JSON: {"sections": [{"referenced_section": "...", "extraction_query": "..."}]}"#;

const EVALUATE: &str = r#"You review an answer against the query and the knowledge it was built from. Flag unsupported claims, missing steps, and unclear structure.
Return only JSON: {"needs_improvement": true | false, "improvement_areas": "..."}"#;

const IMPROVE: &str = r#"You revise the answer to the query so it addresses every point in the evaluation, using only the provided knowledge. Keep the markdown structure and image markup.
Return only JSON: {"improved_answer": "..."}"#;

const VERIFY_FACT: &str = r#"You check whether the knowledge context states or directly supports the fact.
Return only JSON: {"decision": "yes" | "no"}"#;

const LOCATE_IMAGE: &str = r#"You look for image markup in the section whose description matches the referenced image. Report the image path exactly as written.
Return only JSON: {"reference_present": true | false, "image_path": "..."}"#;

/// System prompt for `action`; `compressed` only affects knowledge extraction.
pub fn system_prompt(action: AgentAction, compressed: bool) -> Cow<'static, str> {
    let base = match action {
        AgentAction::SelectDocument => SELECT_DOCUMENT,
        AgentAction::RewriteQuery => REWRITE_QUERY,
        AgentAction::ExtractKnowledge => EXTRACT_KNOWLEDGE,
        AgentAction::Decide => DECIDE,
        AgentAction::Answer => ANSWER,
        AgentAction::ConciseAnswer => CONCISE_ANSWER,
        AgentAction::MissingInfo => MISSING_INFO,
        AgentAction::Evaluate => EVALUATE,
        AgentAction::Improve => IMPROVE,
        AgentAction::VerifyFact => VERIFY_FACT,
        AgentAction::LocateImage => LOCATE_IMAGE,
    };
    if compressed && action == AgentAction::ExtractKnowledge {
        Cow::Owned(format!("{base}{COMPRESSION_SUFFIX}"))
    } else {
        Cow::Borrowed(base)
    }
}

// =============================================================================
// User messages
// =============================================================================

pub fn select_document_message(query: &str, documents: &[DocumentMetadata]) -> String {
    let docs = documents
        .iter()
        .map(|d| {
            format!(
                "<document>\n<filename>{}</filename>\n<summary>{}</summary>\n</document>",
                d.filename, d.summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{}\n{}",
        tagged("query", &escape_xml_chars(query)),
        tagged("documents", &docs)
    )
}

pub fn rewrite_message(query: &str, summary: Option<&str>) -> String {
    let mut parts = vec![tagged("query", &escape_xml_chars(query))];
    if let Some(summary) = summary {
        parts.push(tagged("document_summary", summary));
    }
    parts.join("\n\n")
}

pub fn extraction_message(query: &str, chunk: &str) -> String {
    format!(
        "{}\n{}",
        tagged("user_query", &escape_xml_chars(query)),
        tagged("document_chunk", chunk)
    )
}

/// Shared by Decide, Answer and ConciseAnswer.
pub fn knowledge_message(query: &str, knowledge: &str) -> String {
    format!("{}\n\n{}", tagged("query", &escape_xml_chars(query)), knowledge)
}

pub fn missing_info_message(answer: &str, summary: Option<&str>) -> String {
    let mut parts = vec![tagged("content", answer)];
    if let Some(summary) = summary {
        parts.push(tagged("document_summary", summary));
    }
    parts.join("\n\n")
}

pub fn evaluation_message(query: &str, knowledge: &str, answer: &str) -> String {
    [
        tagged("query", &escape_xml_chars(query)),
        tagged("knowledge_chunks", knowledge),
        tagged("answer", answer),
    ]
    .join("\n")
}

pub fn improve_message(query: &str, answer: &str, feedback: &str, knowledge: &str) -> String {
    [
        tagged("query", &escape_xml_chars(query)),
        tagged("answer", answer),
        knowledge.to_string(),
        tagged("evaluation", &escape_xml_chars(feedback)),
    ]
    .join("\n\n")
}

pub fn verify_message(fact: &str, context: &str) -> String {
    format!(
        "{}\n\n{}",
        tagged("fact", fact),
        tagged("knowledge_context", context)
    )
}

pub fn locate_image_message(alt_text: &str, section: &str) -> String {
    format!(
        "{}\n{}",
        tagged("image_reference", &escape_xml_chars(alt_text)),
        tagged("section", section)
    )
}

// =============================================================================
// TESTS
// =============================================================================
