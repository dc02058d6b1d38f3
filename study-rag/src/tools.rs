//! Retrieval tools exposed to the LLM tool-call loop.
//!
//! Three tools wrap a [`RetrievalService`]:
//!
//! - `search_all_documents { query, limit?, minSimilarity? }`
//! - `search_specific_documents { query, documentIds, limit?, minSimilarity? }`
//! - `find_document_ids { documentNames }`
//!
//! Search tools answer with passages formatted as `[Source: <name>]` blocks
//! (the inline marker syntax the citation parser resolves) plus their
//! similarity percentage, or with a structured "no results" payload carrying
//! suggestions. `limit` is clamped to the configured tool maximum.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = ToolRegistry::standard(service.clone());
//! let output = registry
//!     .call("search_all_documents", &scope, json!({"query": "pricing"}), Some(&emitter))
//!     .await?;
//! ```

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info};

use crate::document::SearchResult;
use crate::error::{RagError, Result};
use crate::events::{EventEmitter, StreamEvent};
use crate::scope::Scope;
use crate::search::SearchRequest;
use crate::service::RetrievalService;

pub const SEARCH_ALL_DOCUMENTS: &str = "search_all_documents";
pub const SEARCH_SPECIFIC_DOCUMENTS: &str = "search_specific_documents";
pub const FIND_DOCUMENT_IDS: &str = "find_document_ids";

/// A document reference returned by `find_document_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    pub document_id: String,
    pub document_name: String,
}

/// What a retrieval tool hands back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ToolOutput {
    Results {
        /// Passages formatted for the model.
        text: String,
        result_count: usize,
        document_count: usize,
        results: Vec<SearchResult>,
    },
    NoResults {
        message: String,
        suggestions: Vec<String>,
    },
    Documents {
        documents: Vec<DocumentRef>,
        unmatched: Vec<String>,
    },
}

impl ToolOutput {
    pub fn is_empty(&self) -> bool {
        matches!(self, ToolOutput::NoResults { .. })
    }

    /// The text given to the model as the tool result.
    pub fn to_model_text(&self) -> String {
        match self {
            ToolOutput::Results { text, .. } => text.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

/// Format passages for the model, one `[Source: ...]` block per result.
pub fn format_passages(results: &[SearchResult]) -> String {
    let documents: HashSet<&str> = results.iter().map(|r| r.document_id.as_str()).collect();
    let mut text = format!(
        "Found {} relevant passage{} in {} document{}.\n",
        results.len(),
        if results.len() == 1 { "" } else { "s" },
        documents.len(),
        if documents.len() == 1 { "" } else { "s" },
    );
    for result in results {
        let _ = write!(
            text,
            "\n[Source: {}] (similarity {})\n{}\n",
            result.document_name,
            result.similarity_percent(),
            result.content.trim()
        );
    }
    text
}

fn search_output(results: Vec<SearchResult>, min_similarity: f32, specific: bool) -> ToolOutput {
    if results.is_empty() {
        let mut suggestions = vec![
            "Try broader or differently worded search terms.".to_string(),
            format!(
                "Lower minSimilarity (currently {min_similarity:.2}) to include weaker matches."
            ),
        ];
        if specific {
            suggestions.push(
                "Search all documents instead of this subset, or check the IDs with find_document_ids."
                    .to_string(),
            );
        } else {
            suggestions.push("Make sure the study contains processed documents.".to_string());
        }
        return ToolOutput::NoResults {
            message: "No passages matched the query.".to_string(),
            suggestions,
        };
    }
    let document_count =
        results.iter().map(|r| r.document_id.as_str()).collect::<HashSet<_>>().len();
    ToolOutput::Results {
        text: format_passages(&results),
        result_count: results.len(),
        document_count,
        results,
    }
}

fn parse_args<A: DeserializeOwned>(tool: &str, args: Value) -> Result<A> {
    serde_json::from_value(args)
        .map_err(|e| RagError::InvalidQuery(format!("invalid arguments for {tool}: {e}")))
}

/// A retrieval operation the model can call.
#[async_trait]
pub trait RetrievalTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments.
    fn parameters_schema(&self) -> Value;

    /// Run the tool within the caller's scope.
    async fn execute(&self, scope: &Scope, args: Value) -> Result<ToolOutput>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchAllArgs {
    query: String,
    limit: Option<usize>,
    min_similarity: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSpecificArgs {
    query: String,
    document_ids: Vec<String>,
    limit: Option<usize>,
    min_similarity: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindDocumentIdsArgs {
    document_names: Vec<String>,
}

fn request_for(
    service: &RetrievalService,
    query: String,
    limit: Option<usize>,
    min_similarity: Option<f32>,
) -> SearchRequest {
    let config = service.config();
    let limit = limit.unwrap_or(config.default_limit).clamp(1, config.max_tool_limit);
    SearchRequest::new(query, limit, min_similarity.unwrap_or(config.min_similarity))
}

/// Searches every document of the caller's study.
pub struct SearchAllDocumentsTool {
    service: Arc<RetrievalService>,
}

impl SearchAllDocumentsTool {
    pub fn new(service: Arc<RetrievalService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RetrievalTool for SearchAllDocumentsTool {
    fn name(&self) -> &str {
        SEARCH_ALL_DOCUMENTS
    }

    fn description(&self) -> &str {
        "Search all documents in the current study for passages relevant to a query"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to look for"},
                "limit": {
                    "type": "integer",
                    "description": format!("Maximum passages to return (at most {})", self.service.config().max_tool_limit)
                },
                "minSimilarity": {"type": "number", "description": "Minimum similarity between 0 and 1"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, scope: &Scope, args: Value) -> Result<ToolOutput> {
        let args: SearchAllArgs = parse_args(self.name(), args)?;
        let request = request_for(&self.service, args.query, args.limit, args.min_similarity);
        info!(query = %request.query, limit = request.limit, "search_all_documents called");

        let results = self.service.search(scope, &request).await?;
        Ok(search_output(results, request.min_similarity, false))
    }
}

/// Searches an explicit subset of the study's documents.
pub struct SearchSpecificDocumentsTool {
    service: Arc<RetrievalService>,
}

impl SearchSpecificDocumentsTool {
    pub fn new(service: Arc<RetrievalService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RetrievalTool for SearchSpecificDocumentsTool {
    fn name(&self) -> &str {
        SEARCH_SPECIFIC_DOCUMENTS
    }

    fn description(&self) -> &str {
        "Search only the given documents of the current study for passages relevant to a query"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to look for"},
                "documentIds": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "IDs of the documents to search (see find_document_ids)"
                },
                "limit": {
                    "type": "integer",
                    "description": format!("Maximum passages to return (at most {})", self.service.config().max_tool_limit)
                },
                "minSimilarity": {"type": "number", "description": "Minimum similarity between 0 and 1"}
            },
            "required": ["query", "documentIds"]
        })
    }

    async fn execute(&self, scope: &Scope, args: Value) -> Result<ToolOutput> {
        let args: SearchSpecificArgs = parse_args(self.name(), args)?;

        // Narrowing only: a caller already limited to some documents cannot widen.
        if let Some(allowed) = &scope.document_ids {
            let outside: Vec<String> =
                args.document_ids.iter().filter(|id| !allowed.contains(id)).cloned().collect();
            if !outside.is_empty() {
                return Err(RagError::AccessDenied {
                    study_id: scope.study_id.clone(),
                    document_ids: outside,
                });
            }
        }

        let request = request_for(&self.service, args.query, args.limit, args.min_similarity);
        info!(
            query = %request.query,
            documents = args.document_ids.len(),
            limit = request.limit,
            "search_specific_documents called"
        );
        let scope = scope.clone().with_documents(args.document_ids);
        let results = self.service.search(&scope, &request).await?;
        Ok(search_output(results, request.min_similarity, true))
    }
}

/// Resolves document names to IDs.
pub struct FindDocumentIdsTool {
    service: Arc<RetrievalService>,
}

impl FindDocumentIdsTool {
    pub fn new(service: Arc<RetrievalService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RetrievalTool for FindDocumentIdsTool {
    fn name(&self) -> &str {
        FIND_DOCUMENT_IDS
    }

    fn description(&self) -> &str {
        "Look up the IDs of documents in the current study by their names"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "documentNames": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Document names, e.g. file names"
                }
            },
            "required": ["documentNames"]
        })
    }

    async fn execute(&self, scope: &Scope, args: Value) -> Result<ToolOutput> {
        let args: FindDocumentIdsArgs = parse_args(self.name(), args)?;
        if args.document_names.iter().all(|n| n.trim().is_empty()) {
            return Err(RagError::InvalidQuery("documentNames is empty".into()));
        }

        let resolution = self.service.find_document_ids(scope, &args.document_names).await?;
        if resolution.found.is_empty() {
            let available = self.service.study_documents(scope).await?;
            let names: Vec<&str> = available.iter().map(|d| d.name.as_str()).collect();
            let mut suggestions = vec!["Check the spelling of the document names.".to_string()];
            if !names.is_empty() {
                suggestions.push(format!("Available documents: {}", names.join(", ")));
            }
            suggestions.push("Search all documents instead.".to_string());
            return Ok(ToolOutput::NoResults {
                message: "None of the named documents exist in this study.".to_string(),
                suggestions,
            });
        }

        Ok(ToolOutput::Documents {
            documents: resolution
                .found
                .into_iter()
                .map(|d| DocumentRef { document_id: d.id, document_name: d.name })
                .collect(),
            unmatched: resolution.unmatched,
        })
    }
}

/// Named set of retrieval tools that reports calls on the event stream.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn RetrievalTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three standard retrieval tools.
    pub fn standard(service: Arc<RetrievalService>) -> Self {
        Self::new()
            .with_tool(Arc::new(SearchAllDocumentsTool::new(service.clone())))
            .with_tool(Arc::new(SearchSpecificDocumentsTool::new(service.clone())))
            .with_tool(Arc::new(FindDocumentIdsTool::new(service)))
    }

    pub fn with_tool(mut self, tool: Arc<dyn RetrievalTool>) -> Self {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn RetrievalTool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool declarations in the shape model APIs expect.
    pub fn declarations(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect()
    }

    /// Run a tool by name, bracketing it with `tool-call-start` and
    /// `tool-call-end` events when an emitter is given.
    ///
    /// # Errors
    ///
    /// [`RagError::NotFound`] for an unknown tool name, otherwise whatever
    /// the tool returns.
    pub async fn call(
        &self,
        name: &str,
        scope: &Scope,
        args: Value,
        events: Option<&EventEmitter>,
    ) -> Result<ToolOutput> {
        let tool = self.get(name).ok_or_else(|| RagError::NotFound(format!("tool '{name}'")))?;

        if let Some(events) = events {
            events.emit(StreamEvent::ToolCallStart { tool_name: name.to_string() }).await;
        }
        let result = tool.execute(scope, args).await;
        if let Err(e) = &result {
            error!(tool = name, error = %e, "tool call failed");
        }
        if let Some(events) = events {
            events
                .emit(StreamEvent::ToolCallEnd {
                    tool_name: name.to_string(),
                    success: result.is_ok(),
                })
                .await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(doc: &str, similarity: f32) -> SearchResult {
        SearchResult {
            chunk_id: format!("{doc}_0"),
            document_id: doc.into(),
            document_name: format!("{doc}.pdf"),
            content: "  Users wanted faster onboarding.  ".into(),
            similarity,
            chunk_index: 0,
        }
    }

    #[test]
    fn passages_carry_markers_and_percentages() {
        let text = format_passages(&[result("a", 0.876), result("b", 0.5)]);
        assert!(text.starts_with("Found 2 relevant passages in 2 documents."));
        assert!(
            text.contains("[Source: a.pdf] (similarity 88%)\nUsers wanted faster onboarding.\n")
        );
        assert!(text.contains("[Source: b.pdf] (similarity 50%)"));
    }

    #[test]
    fn empty_search_suggests_next_steps() {
        let output = search_output(Vec::new(), 0.3, true);
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["status"], "no-results");
        let suggestions = value["suggestions"].as_array().unwrap();
        assert_eq!(suggestions.len(), 3);
        assert!(suggestions[1].as_str().unwrap().contains("0.30"));
    }

    #[test]
    fn bad_arguments_are_invalid_queries() {
        let err =
            parse_args::<SearchAllArgs>(SEARCH_ALL_DOCUMENTS, json!({"limit": 3})).unwrap_err();
        assert!(matches!(err, RagError::InvalidQuery(_)));
    }
}
