//! Scoped vector search: embed → fetch scoped candidates → score → rank.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::codec::decode_embedding_with_dim;
use crate::config::RagConfig;
use crate::document::{SearchResult, StoredChunk, by_similarity_desc};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::retry::{RetryPolicy, retry};
use crate::scope::AuthorizedScope;
use crate::similarity::cosine_similarity;
use crate::store::ChunkStore;

/// Longest query accepted, in characters.
pub const MAX_QUERY_CHARS: usize = 8_000;

/// Parameters of one search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    pub min_similarity: f32,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, limit: usize, min_similarity: f32) -> Self {
        Self { query: query.into(), limit, min_similarity }
    }

    /// Reject requests that can never succeed. These errors are not retried.
    pub fn validate(&self) -> Result<()> {
        let trimmed = self.query.trim();
        if trimmed.is_empty() {
            return Err(RagError::InvalidQuery("query is empty".into()));
        }
        if trimmed.chars().count() > MAX_QUERY_CHARS {
            return Err(RagError::InvalidQuery(format!(
                "query exceeds {MAX_QUERY_CHARS} characters"
            )));
        }
        if self.limit == 0 {
            return Err(RagError::InvalidQuery("limit must be greater than zero".into()));
        }
        if !(-1.0..=1.0).contains(&self.min_similarity) {
            return Err(RagError::InvalidQuery(format!(
                "min_similarity ({}) must be within [-1, 1]",
                self.min_similarity
            )));
        }
        Ok(())
    }
}

/// Score decoded candidates against a query vector.
///
/// Candidates without an embedding, with an undecodable blob, or with a
/// different dimension are skipped. Results below `min_similarity` are
/// dropped; the rest are sorted by similarity (stable for ties) and
/// truncated to `limit`.
pub fn rank_candidates(
    candidates: Vec<StoredChunk>,
    query_embedding: &[f32],
    limit: usize,
    min_similarity: f32,
) -> Vec<SearchResult> {
    let mut scored: Vec<SearchResult> = candidates
        .into_iter()
        .filter_map(|mut chunk| {
            let blob = chunk.embedding.take()?;
            let vector = match decode_embedding_with_dim(&blob, query_embedding.len()) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        chunk_id = %chunk.id,
                        error = %e,
                        "skipping chunk with unusable embedding"
                    );
                    return None;
                }
            };
            let similarity = cosine_similarity(&vector, query_embedding);
            (similarity >= min_similarity).then(|| SearchResult::from_stored(chunk, similarity))
        })
        .collect();

    scored.sort_by(by_similarity_desc);
    scored.truncate(limit);
    scored
}

/// Vector search over the chunks of an authorized scope.
///
/// # Example
///
/// ```rust,ignore
/// let engine = VectorSearchEngine::new(embedder, store, &RagConfig::default());
/// let scope = resolver.authorize(&Scope::study("u1", "s1")).await?;
/// let hits = engine.search(&scope, &SearchRequest::new("pricing", 5, 0.5)).await?;
/// ```
pub struct VectorSearchEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn ChunkStore>,
    retry: RetryPolicy,
}

impl VectorSearchEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn ChunkStore>,
        config: &RagConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            retry: RetryPolicy::fixed(config.retry_attempts, config.retry_delay()),
        }
    }

    /// Override the retry policy for transient failures.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Embed a query, retrying transient provider failures.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let provider = self.embedder.name().to_string();
        retry(self.retry, "embed_query", || {
            let provider = provider.clone();
            async move { self.embedder.embed_outcome(query).await.into_result(&provider) }
        })
        .await
    }

    /// Run one search.
    ///
    /// # Errors
    ///
    /// - [`RagError::InvalidQuery`] for an unusable request (no retry).
    /// - [`RagError::EmbeddingError`] / [`RagError::ChunkStoreError`] once
    ///   retries of a transient failure are exhausted.
    #[instrument(skip_all, fields(study_id = %scope.study_id(), limit = request.limit))]
    pub async fn search(
        &self,
        scope: &AuthorizedScope,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>> {
        request.validate()?;

        let query_embedding = self.embed_query(&request.query).await?;

        let candidates = retry(self.retry, "fetch_scoped_chunks", || {
            self.store.fetch_scoped_chunks(scope.study_id(), scope.document_ids())
        })
        .await?;
        debug!(candidates = candidates.len(), backend = self.store.backend(), "fetched candidates");

        let results =
            rank_candidates(candidates, &query_embedding, request.limit, request.min_similarity);
        info!(result_count = results.len(), "search completed");
        Ok(results)
    }
}
