//! Attribution by asking the reasoning service whether a page supports a
//! statement.

use async_trait::async_trait;
use uuid::Uuid;

use super::attribute::assemble;
use super::segment::segment;
use super::{is_citable, Attributed, AttributionError, Attributor, SourcePage};
use crate::agents::AgentRunner;
use crate::fanout::FanOut;

/// For each citable segment, the first page (in page order) that the verifier
/// confirms becomes its match. A failed verification counts as "no".
pub struct FactCheckAttributor {
    agents: AgentRunner,
    min_length: usize,
    concurrency: usize,
}

impl FactCheckAttributor {
    pub fn new(agents: AgentRunner, min_length: usize, concurrency: usize) -> Self {
        Self {
            agents,
            min_length,
            concurrency,
        }
    }

    async fn first_confirmed(&self, fact: &str, pages: &[&SourcePage]) -> Option<u32> {
        let fan = FanOut::new("verify_fact", self.concurrency);
        let tasks: Vec<_> = pages
            .iter()
            .map(|page| self.agents.verify_fact(fact, &page.content))
            .collect();
        let verdicts = fan.results(tasks).await;
        pages
            .iter()
            .zip(verdicts)
            .find_map(|(page, verdict)| match verdict {
                Ok(true) => Some(page.page),
                Ok(false) => None,
                Err(e) => {
                    tracing::debug!(page = page.page, error = %e, "verification failed; treated as no");
                    None
                }
            })
    }
}

#[async_trait]
impl Attributor for FactCheckAttributor {
    async fn attribute(
        &self,
        answer: &str,
        pages: &[SourcePage],
        _request_id: Uuid,
    ) -> Result<Attributed, AttributionError> {
        let segments = segment(answer);
        let mut ordered: Vec<&SourcePage> = pages
            .iter()
            .filter(|p| !p.content.trim().is_empty())
            .collect();
        ordered.sort_by_key(|p| p.page);
        if ordered.is_empty() {
            return Ok(Attributed::unchanged(answer));
        }

        let mut matches = vec![None; segments.len()];
        for (idx, seg) in segments.iter().enumerate() {
            if is_citable(seg, self.min_length) {
                matches[idx] = self.first_confirmed(&seg.text, &ordered).await;
            }
        }
        Ok(assemble(answer, &segments, &matches))
    }
}
