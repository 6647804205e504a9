//! Structured outputs declared for each agent action.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentChoice {
    pub filename: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewrittenQueries {
    #[serde(default)]
    pub rewritten_queries: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedKnowledge {
    #[serde(default)]
    pub knowledge: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Answer,
    Reflect,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionOutput {
    pub action: Decision,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConciseAnswer {
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSection {
    pub referenced_section: String,
    pub extraction_query: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MissingInfo {
    #[serde(default)]
    pub sections: Vec<MissingSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Evaluation {
    pub needs_improvement: bool,
    #[serde(default)]
    pub improvement_areas: String,
}

impl Evaluation {
    pub fn approved(&self) -> bool {
        !self.needs_improvement
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImprovedAnswer {
    pub improved_answer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactVerdict {
    pub decision: String,
}

impl FactVerdict {
    pub fn confirmed(&self) -> bool {
        self.decision.trim().eq_ignore_ascii_case("yes")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageLocation {
    #[serde(default)]
    pub reference_present: bool,
    #[serde(default)]
    pub image_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_parses_lowercase_tags() {
        let d: DecisionOutput = serde_json::from_str(r#"{"action": "reflect"}"#).unwrap();
        assert_eq!(d.action, Decision::Reflect);
        assert!(serde_json::from_str::<DecisionOutput>(r#"{"action": "maybe"}"#).is_err());
    }

    #[test]
    fn verdict_is_case_insensitive() {
        let v: FactVerdict = serde_json::from_str(r#"{"decision": " YES "}"#).unwrap();
        assert!(v.confirmed());
        let v: FactVerdict = serde_json::from_str(r#"{"decision": "no"}"#).unwrap();
        assert!(!v.confirmed());
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let m: MissingInfo = serde_json::from_str("{}").unwrap();
        assert!(m.sections.is_empty());
    }
}
