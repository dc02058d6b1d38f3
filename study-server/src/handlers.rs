use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use study_rag::{
    DocumentInfo, IngestReport, NameResolution, Scope, SearchRequest, SearchResult,
    SummaryRetrieval, ToolOutput, ValidatedCitations, validate_citations_text,
};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Who is asking, and optionally which documents they may search.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeParams {
    pub user_id: String,
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
}

impl ScopeParams {
    pub fn into_scope(self, study_id: String) -> Scope {
        Scope { user_id: self.user_id, study_id, document_ids: self.document_ids }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchBody {
    #[serde(flatten)]
    pub scope: ScopeParams,
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub min_similarity: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallBody {
    #[serde(flatten)]
    pub scope: ScopeParams,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    pub output: ToolOutput,
    /// What the model receives as the tool result.
    pub model_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveNamesBody {
    #[serde(flatten)]
    pub scope: ScopeParams,
    pub names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateCitationsBody {
    #[serde(flatten)]
    pub scope: ScopeParams,
    /// Raw model output carrying the citation list.
    pub response: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestBody {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentsResponse {
    pub documents: Vec<DocumentInfo>,
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "study-server"}))
}

/// GET /api/tools
pub async fn list_tools(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(state.tools.declarations())
}

/// GET /api/studies/{study_id}/documents?userId=...
pub async fn list_documents(
    Path(study_id): Path<String>,
    Query(query): Query<UserQuery>,
    State(state): State<AppState>,
) -> ApiResult<Json<DocumentsResponse>> {
    let scope = Scope::study(query.user_id, study_id);
    let documents = state.service.study_documents(&scope).await?;
    Ok(Json(DocumentsResponse { documents }))
}

/// POST /api/studies/{study_id}/documents
///
/// The first upload into a study makes the caller its owner.
pub async fn ingest_document(
    Path(study_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> ApiResult<(StatusCode, Json<IngestReport>)> {
    Scope::study(body.user_id.as_str(), study_id.as_str()).validate()?;
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("document name must not be empty".into()));
    }
    let info = DocumentInfo::new(study_id, body.name.trim());
    let report = state.ingestor.ingest(&body.user_id, info, &body.text).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// DELETE /api/documents/{document_id}?userId=...
pub async fn delete_document(
    Path(document_id): Path<String>,
    Query(query): Query<UserQuery>,
    State(state): State<AppState>,
) -> ApiResult<StatusCode> {
    let outcome = state.ingestor.delete(&query.user_id, &document_id).await?;
    info!(document.id = %document_id, ?outcome, "document removed");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/studies/{study_id}/search
pub async fn search(
    Path(study_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> ApiResult<Json<SearchResponse>> {
    let config = state.service.config();
    let request = SearchRequest::new(
        body.query,
        body.limit.unwrap_or(config.default_limit),
        body.min_similarity.unwrap_or(config.min_similarity),
    );
    let scope = body.scope.into_scope(study_id);
    let results = state.service.search(&scope, &request).await?;
    Ok(Json(SearchResponse { results }))
}

/// POST /api/studies/{study_id}/summary
pub async fn study_summary(
    Path(study_id): Path<String>,
    State(state): State<AppState>,
    Json(params): Json<ScopeParams>,
) -> ApiResult<Json<SummaryRetrieval>> {
    let scope = params.into_scope(study_id);
    let summary = state.service.study_summary(&scope, None).await?;
    Ok(Json(summary))
}

/// POST /api/studies/{study_id}/documents/resolve
pub async fn resolve_document_names(
    Path(study_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<ResolveNamesBody>,
) -> ApiResult<Json<NameResolution>> {
    let scope = body.scope.into_scope(study_id);
    let resolution = state.service.find_document_ids(&scope, &body.names).await?;
    Ok(Json(resolution))
}

/// POST /api/studies/{study_id}/tools/{name}
pub async fn call_tool(
    Path((study_id, name)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<ToolCallBody>,
) -> ApiResult<Json<ToolCallResponse>> {
    let scope = body.scope.into_scope(study_id);
    let output = state.tools.call(&name, &scope, body.arguments, None).await?;
    let model_text = output.to_model_text();
    Ok(Json(ToolCallResponse { output, model_text }))
}

/// POST /api/studies/{study_id}/citations/validate
pub async fn validate_citations(
    Path(study_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<ValidateCitationsBody>,
) -> ApiResult<Json<ValidatedCitations>> {
    let scope = body.scope.into_scope(study_id);
    let known = state.service.study_documents(&scope).await?;
    Ok(Json(validate_citations_text(&body.response, &known)))
}
