//! Bounded fan-out of independent, fallible tasks.
//!
//! A failing task is logged and dropped; it never aborts the batch. Tasks only
//! return values. Whoever awaits the batch applies the results afterwards, so
//! shared state has a single writer.

use std::fmt::Display;
use std::future::Future;

use futures::stream::{self, StreamExt};

/// One fan-out stage: a label for logs and a concurrency bound.
#[derive(Debug, Clone, Copy)]
pub struct FanOut {
    label: &'static str,
    limit: usize,
}

impl FanOut {
    /// `limit` is clamped to at least one task in flight.
    pub fn new(label: &'static str, limit: usize) -> Self {
        Self {
            label,
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Every outcome, in input order.
    pub async fn results<I, F, T, E>(&self, tasks: I) -> Vec<Result<T, E>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>>,
    {
        stream::iter(tasks).buffered(self.limit).collect().await
    }

    /// Successful results in input order; failures are logged and skipped.
    pub async fn ordered<I, F, T, E>(&self, tasks: I) -> Vec<T>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let results = self.results(tasks).await;
        self.keep_successes(results.into_iter().enumerate())
    }

    /// Successful results in completion order; failures are logged and skipped.
    pub async fn unordered<I, F, T, E>(&self, tasks: I) -> Vec<T>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let indexed = tasks
            .into_iter()
            .enumerate()
            .map(|(idx, task)| async move { (idx, task.await) });
        let results: Vec<(usize, Result<T, E>)> = stream::iter(indexed)
            .buffer_unordered(self.limit)
            .collect()
            .await;
        self.keep_successes(results)
    }

    /// Log each failure against its task index and return the rest.
    pub fn keep_successes<R, T, E>(&self, results: R) -> Vec<T>
    where
        R: IntoIterator<Item = (usize, Result<T, E>)>,
        E: Display,
    {
        results
            .into_iter()
            .filter_map(|(idx, result)| match result {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(
                        stage = self.label,
                        task = idx,
                        error = %err,
                        "task failed; excluded from results"
                    );
                    None
                }
            })
            .collect()
    }
}
