//! Deterministic test doubles.
//!
//! [`MockEmbeddingProvider`] maps texts to fixed vectors by keyword and can
//! be told to fail or to stall, which is enough to drive the search engine,
//! the multi-query orchestrator and the retry paths without a network.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

const PROVIDER: &str = "Mock";

#[derive(Debug, Default)]
struct MockState {
    /// Remaining transient failures per keyword (`usize::MAX` = always).
    failures: Vec<(String, usize)>,
}

/// Keyword-table embedding provider.
///
/// A text embeds to the vector of the first registered keyword it contains
/// (case-insensitive), or to the fallback vector.
///
/// # Example
///
/// ```rust,ignore
/// let embedder = MockEmbeddingProvider::new(2)
///     .with_keyword("pricing", vec![1.0, 0.0])
///     .with_keyword("onboarding", vec![0.0, 1.0])
///     .failing_on("theme");
/// ```
#[derive(Debug)]
pub struct MockEmbeddingProvider {
    dim: usize,
    keywords: Vec<(String, Vec<f32>)>,
    fallback: Vec<f32>,
    delay: Option<Duration>,
    state: Mutex<MockState>,
    calls: AtomicUsize,
}

impl MockEmbeddingProvider {
    /// A provider whose fallback is the first unit vector.
    pub fn new(dim: usize) -> Self {
        let dim = dim.max(1);
        let mut fallback = vec![0.0; dim];
        fallback[0] = 1.0;
        Self {
            dim,
            keywords: Vec::new(),
            fallback,
            delay: None,
            state: Mutex::new(MockState::default()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_keyword(mut self, keyword: &str, vector: Vec<f32>) -> Self {
        self.keywords.push((keyword.to_lowercase(), vector));
        self
    }

    pub fn with_fallback(mut self, vector: Vec<f32>) -> Self {
        self.fallback = vector;
        self
    }

    /// Sleep before answering; useful for cancellation tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always fail texts containing `keyword` with a transient error.
    pub fn failing_on(self, keyword: &str) -> Self {
        self.failing_times(keyword, usize::MAX)
    }

    /// Fail texts containing `keyword` the next `times` calls.
    pub fn failing_times(self, keyword: &str, times: usize) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push((keyword.to_lowercase(), times));
        }
        self
    }

    /// Number of `embed` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self, lower: &str) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        for (keyword, remaining) in state.failures.iter_mut() {
            if *remaining > 0 && lower.contains(keyword.as_str()) {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let lower = text.to_lowercase();
        if self.should_fail(&lower) {
            return Err(RagError::EmbeddingError {
                provider: PROVIDER.into(),
                message: format!("simulated failure for '{text}'"),
            });
        }

        Ok(self
            .keywords
            .iter()
            .find(|(keyword, _)| lower.contains(keyword.as_str()))
            .map(|(_, vector)| vector.clone())
            .unwrap_or_else(|| self.fallback.clone()))
    }

    fn dimensions(&self) -> usize {
        self.dim
    }
}

/// A unit vector at `cos` similarity to `[1, 0]`, as `[cos, sin]`.
pub fn vector_at_similarity(cos: f32) -> Vec<f32> {
    vec![cos, (1.0 - cos * cos).max(0.0).sqrt()]
}
