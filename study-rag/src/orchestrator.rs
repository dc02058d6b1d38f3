//! Multi-query retrieval.
//!
//! [`MultiQueryRetriever`] runs several queries over one scope concurrently,
//! waits for every one of them to settle, and merges what succeeded:
//!
//! 1. deduplicate near-identical passages ([`deduplicate`]),
//! 2. cap results per document ([`balance_by_document`]),
//! 3. rank by similarity and truncate to the final cap.
//!
//! A failing sub-query is logged and excluded. When nothing at all comes
//! back the batch resolves to [`RetrievalOutcome::NoResults`] instead of an
//! error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::config::RagConfig;
use crate::document::{DocumentGroup, SearchResult, by_similarity_desc, group_by_document};
use crate::error::{RagError, Result};
use crate::events::{EventEmitter, ProgressDetail, StreamEvent, SynthesisStage};
use crate::scope::AuthorizedScope;
use crate::search::{SearchRequest, VectorSearchEngine};

/// Queries used to gather background context for a study summary.
pub const CONTEXT_QUERIES: &[&str] = &[
    "research goals and objectives of the study",
    "participant background, roles and demographics",
    "study methodology, setting and context",
];

/// Queries used to surface notable details for a study summary.
pub const DETAIL_QUERIES: &[&str] = &[
    "surprising or unexpected findings",
    "pain points, frustrations and problems",
    "memorable quotes and strong opinions",
];

/// Dedup key: the first `prefix_chars` characters, lower-cased and trimmed.
fn dedup_key(content: &str, prefix_chars: usize) -> String {
    content.chars().take(prefix_chars).collect::<String>().to_lowercase().trim().to_string()
}

/// Drop results whose content prefix matches an earlier result.
///
/// The first occurrence wins. Applying this twice yields the same output.
pub fn deduplicate(results: Vec<SearchResult>, prefix_chars: usize) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    results.into_iter().filter(|r| seen.insert(dedup_key(&r.content, prefix_chars))).collect()
}

/// Keep at most `per_document` results per document, best first.
///
/// Documents appear in first-seen order; the caller re-ranks afterwards.
pub fn balance_by_document(results: Vec<SearchResult>, per_document: usize) -> Vec<SearchResult> {
    let mut order: Vec<String> = Vec::new();
    let mut by_doc: HashMap<String, Vec<SearchResult>> = HashMap::new();
    for result in results {
        if !by_doc.contains_key(&result.document_id) {
            order.push(result.document_id.clone());
        }
        by_doc.entry(result.document_id.clone()).or_default().push(result);
    }

    let mut balanced = Vec::new();
    for id in order {
        if let Some(mut chunks) = by_doc.remove(&id) {
            chunks.sort_by(by_similarity_desc);
            chunks.truncate(per_document);
            balanced.extend(chunks);
        }
    }
    balanced
}

/// Merge step shared by every batch: dedup → balance → rank → truncate.
pub fn merge_results(results: Vec<SearchResult>, options: &BatchOptions) -> Vec<SearchResult> {
    let deduped = deduplicate(results, options.dedup_prefix_chars);
    let mut balanced = balance_by_document(deduped, options.per_document_cap);
    balanced.sort_by(by_similarity_desc);
    balanced.truncate(options.final_cap);
    balanced
}

/// Limits applied to a multi-query batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptions {
    pub per_query_limit: usize,
    pub min_similarity: f32,
    pub per_document_cap: usize,
    pub final_cap: usize,
    pub dedup_prefix_chars: usize,
}

impl From<&RagConfig> for BatchOptions {
    fn from(config: &RagConfig) -> Self {
        Self {
            per_query_limit: config.default_limit,
            min_similarity: config.min_similarity,
            per_document_cap: config.per_document_cap,
            final_cap: config.final_cap,
            dedup_prefix_chars: config.dedup_prefix_chars,
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&RagConfig::default())
    }
}

/// How one sub-query ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SubQueryStatus {
    Succeeded { result_count: usize },
    Empty,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubQueryReport {
    pub query: String,
    #[serde(flatten)]
    pub status: SubQueryStatus,
}

/// Merged output of a batch that found something.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalBatch {
    /// Final ranked results.
    pub results: Vec<SearchResult>,
    /// One report per input query, in input order.
    pub reports: Vec<SubQueryReport>,
}

impl RetrievalBatch {
    /// Group the merged results by document for citation and synthesis.
    pub fn groups(&self) -> Vec<DocumentGroup> {
        group_by_document(self.results.clone())
    }

    pub fn failed_queries(&self) -> impl Iterator<Item = &SubQueryReport> {
        self.reports.iter().filter(|r| matches!(r.status, SubQueryStatus::Failed { .. }))
    }
}

/// Result of a batch: either merged results or an explicit empty state.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalOutcome {
    Found(RetrievalBatch),
    NoResults { reports: Vec<SubQueryReport> },
}

impl RetrievalOutcome {
    pub fn results(&self) -> &[SearchResult] {
        match self {
            RetrievalOutcome::Found(batch) => &batch.results,
            RetrievalOutcome::NoResults { .. } => &[],
        }
    }

    pub fn reports(&self) -> &[SubQueryReport] {
        match self {
            RetrievalOutcome::Found(batch) => &batch.reports,
            RetrievalOutcome::NoResults { reports } => reports,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RetrievalOutcome::NoResults { .. })
    }
}

/// Concurrent multi-query retrieval over one scope.
pub struct MultiQueryRetriever {
    engine: Arc<VectorSearchEngine>,
    options: BatchOptions,
}

impl MultiQueryRetriever {
    pub fn new(engine: Arc<VectorSearchEngine>, options: BatchOptions) -> Self {
        Self { engine, options }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Run every query concurrently, then merge.
    ///
    /// Progress events go to `events` when given. When `cancel` fires
    /// before all sub-queries settle, in-flight work is dropped and
    /// [`RagError::Cancelled`] is returned; nothing is cached or persisted.
    ///
    /// # Errors
    ///
    /// - [`RagError::InvalidQuery`] if no non-blank query was given.
    /// - [`RagError::Cancelled`] on cancellation.
    #[instrument(skip_all, fields(study_id = %scope.study_id(), queries = queries.len()))]
    pub async fn retrieve(
        &self,
        scope: &AuthorizedScope,
        queries: &[String],
        cancel: Option<&CancellationToken>,
        events: Option<&EventEmitter>,
    ) -> Result<RetrievalOutcome> {
        let queries: Vec<&str> =
            queries.iter().map(|q| q.trim()).filter(|q| !q.is_empty()).collect();
        if queries.is_empty() {
            return Err(RagError::InvalidQuery("no queries to run".into()));
        }
        let total = queries.len();

        if let Some(events) = events {
            events
                .emit(StreamEvent::progress(
                    SynthesisStage::Searching,
                    ProgressDetail { total: Some(total), completed: Some(0), ..Default::default() },
                ))
                .await;
        }

        let runs = queries.iter().map(|query| self.run_one(scope, query, total, events));
        let settled = match cancel {
            Some(token) => {
                tokio::select! {
                    settled = join_all(runs) => settled,
                    _ = token.cancelled() => {
                        warn!("retrieval batch cancelled, discarding in-flight results");
                        return Err(RagError::Cancelled);
                    }
                }
            }
            None => join_all(runs).await,
        };

        let mut reports = Vec::with_capacity(total);
        let mut collected = Vec::new();
        for (query, outcome) in queries.iter().zip(settled) {
            let status = match outcome {
                Ok(results) if results.is_empty() => SubQueryStatus::Empty,
                Ok(results) => {
                    let count = results.len();
                    collected.extend(results);
                    SubQueryStatus::Succeeded { result_count: count }
                }
                Err(e) => SubQueryStatus::Failed { error: e.to_string() },
            };
            reports.push(SubQueryReport { query: query.to_string(), status });
        }

        if collected.is_empty() {
            info!(total, "retrieval batch found nothing");
            return Ok(RetrievalOutcome::NoResults { reports });
        }

        let results = merge_results(collected, &self.options);
        info!(result_count = results.len(), "retrieval batch merged");

        if let Some(events) = events {
            let document_count =
                results.iter().map(|r| r.document_id.as_str()).collect::<HashSet<_>>().len();
            events
                .emit(StreamEvent::progress(
                    SynthesisStage::Grouping,
                    ProgressDetail {
                        result_count: Some(results.len()),
                        document_count: Some(document_count),
                        ..Default::default()
                    },
                ))
                .await;
        }

        Ok(RetrievalOutcome::Found(RetrievalBatch { results, reports }))
    }

    async fn run_one(
        &self,
        scope: &AuthorizedScope,
        query: &str,
        total: usize,
        events: Option<&EventEmitter>,
    ) -> Result<Vec<SearchResult>> {
        let request =
            SearchRequest::new(query, self.options.per_query_limit, self.options.min_similarity);
        let outcome = self.engine.search(scope, &request).await;

        if let Err(e) = &outcome {
            warn!(query, error = %e, "sub-query failed, excluding from batch");
        }

        if let Some(events) = events {
            let (stage, detail) = match &outcome {
                Ok(results) => (
                    SynthesisStage::SearchComplete,
                    ProgressDetail {
                        query: Some(query.to_string()),
                        total: Some(total),
                        result_count: Some(results.len()),
                        ..Default::default()
                    },
                ),
                Err(e) => (
                    SynthesisStage::SearchError,
                    ProgressDetail {
                        query: Some(query.to_string()),
                        total: Some(total),
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                ),
            };
            events.emit(StreamEvent::progress(stage, detail)).await;
        }

        outcome
    }
}

/// Retrieval for study-summary generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRetrieval {
    /// Merged results of the context queries.
    pub context: Vec<SearchResult>,
    /// Merged results of the detail queries.
    pub details: Vec<SearchResult>,
    /// Both sets merged together.
    pub combined: Vec<SearchResult>,
}

impl SummaryRetrieval {
    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }
}

/// Hybrid strategy for study summaries: fixed context and detail queries.
pub struct StudySummarySearch {
    retriever: Arc<MultiQueryRetriever>,
    context_queries: Vec<String>,
    detail_queries: Vec<String>,
}

impl StudySummarySearch {
    pub fn new(retriever: Arc<MultiQueryRetriever>) -> Self {
        Self {
            retriever,
            context_queries: CONTEXT_QUERIES.iter().map(|q| q.to_string()).collect(),
            detail_queries: DETAIL_QUERIES.iter().map(|q| q.to_string()).collect(),
        }
    }

    /// Replace the built-in query sets.
    pub fn with_queries(mut self, context: Vec<String>, details: Vec<String>) -> Self {
        self.context_queries = context;
        self.detail_queries = details;
        self
    }

    /// Run both query classes concurrently.
    ///
    /// # Errors
    ///
    /// Only cancellation or an empty query set is an error; failed
    /// sub-queries just contribute nothing.
    pub async fn run(
        &self,
        scope: &AuthorizedScope,
        cancel: Option<&CancellationToken>,
    ) -> Result<SummaryRetrieval> {
        let (context, details) = tokio::join!(
            self.retriever.retrieve(scope, &self.context_queries, cancel, None),
            self.retriever.retrieve(scope, &self.detail_queries, cancel, None),
        );
        let context = context?.results().to_vec();
        let details = details?.results().to_vec();

        let mut all = context.clone();
        all.extend(details.iter().cloned());
        let combined = merge_results(all, self.retriever.options());

        Ok(SummaryRetrieval { context, details, combined })
    }
}
