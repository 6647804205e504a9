//! Resolve bare image references in a finished answer.
//!
//! Drafting sometimes keeps an image's description but loses its path,
//! leaving `![Brake reservoir]`. Each such reference is looked up in the
//! knowledge items that contain image markup and rewritten to
//! `![Brake reservoir](images/p255.jpeg)`.

use std::collections::HashMap;

use fancy_regex::Regex as FancyRegex;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::agents::AgentRunner;
use crate::fanout::FanOut;
use crate::memory::KnowledgeItem;

static BARE_IMAGE: Lazy<FancyRegex> =
    Lazy::new(|| FancyRegex::new(r"!\[([^\]\n]+)\](?!\()").expect("invalid bare image regex"));

static IMAGE_MARKUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]+\)").expect("invalid image markup regex"));

/// A `![alt]` with no path: byte span and alt text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BareImage {
    pub start: usize,
    pub end: usize,
    pub alt: String,
}

pub fn bare_images(text: &str) -> Vec<BareImage> {
    BARE_IMAGE
        .captures_iter(text)
        .filter_map(Result::ok)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(BareImage {
                start: whole.start(),
                end: whole.end(),
                alt: caps.get(1)?.as_str().trim().to_string(),
            })
        })
        .collect()
}

pub fn has_image_markup(text: &str) -> bool {
    IMAGE_MARKUP.is_match(text)
}

pub struct ImageIntegrator {
    agents: AgentRunner,
    concurrency: usize,
}

impl ImageIntegrator {
    pub fn new(agents: AgentRunner, concurrency: usize) -> Self {
        Self {
            agents,
            concurrency,
        }
    }

    /// Rewrite every resolvable bare reference. Unresolved references and
    /// failed lookups leave the text as it was.
    pub async fn integrate(&self, answer: &str, knowledge: &[KnowledgeItem]) -> String {
        let refs = bare_images(answer);
        if refs.is_empty() {
            return answer.to_string();
        }
        let sections: Vec<&str> = knowledge
            .iter()
            .map(|k| k.text.as_str())
            .filter(|t| has_image_markup(t))
            .collect();
        if sections.is_empty() {
            return answer.to_string();
        }

        let mut resolved: HashMap<&str, Option<String>> = HashMap::new();
        for r in &refs {
            if !resolved.contains_key(r.alt.as_str()) {
                let path = self.locate(&r.alt, &sections).await;
                resolved.insert(r.alt.as_str(), path);
            }
        }

        let mut out = answer.to_string();
        for r in refs.iter().rev() {
            if let Some(Some(path)) = resolved.get(r.alt.as_str()) {
                out.replace_range(r.start..r.end, &format!("![{}]({})", r.alt, path));
            }
        }
        out
    }

    /// First section (in knowledge order) that reports the image and whose
    /// text contains the reported path.
    async fn locate(&self, alt: &str, sections: &[&str]) -> Option<String> {
        let fan = FanOut::new("locate_image", self.concurrency);
        let hits = fan
            .results(sections.iter().map(|s| self.agents.locate_image(alt, s)))
            .await;
        sections.iter().zip(hits).find_map(|(section, hit)| match hit {
            Ok(loc) => {
                let path = loc.image_path.trim();
                (loc.reference_present && !path.is_empty() && section.contains(path))
                    .then(|| path.to_string())
            }
            Err(e) => {
                debug!(alt, error = %e, "image lookup failed");
                None
            }
        })
    }
}
