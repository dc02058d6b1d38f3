//! Embeddings from an OpenAI-compatible `/v1/embeddings` endpoint.
//!
//! Only compiled with the `openai` feature. Rate limits, server errors and
//! network failures become transient [`RagError::EmbeddingError`]s, which
//! the search engine and the ingestor retry. Rejected credentials and an
//! unknown model or endpoint are [`RagError::ConfigError`]s; input the API
//! refuses is a [`RagError::InvalidQuery`]. Neither is retried.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ENV_PREFIX;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

const PROVIDER: &str = "OpenAI";

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";
pub const DEFAULT_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_DIMENSIONS: usize = 1536;

/// Remote embedding provider.
///
/// Every returned vector is checked against [`EmbeddingProvider::dimensions`]
/// before it can reach the chunk store, so a model change cannot silently
/// mix vector sizes within a study.
///
/// # Example
///
/// ```rust,ignore
/// use study_rag::openai::OpenAIEmbeddingProvider;
///
/// let provider = OpenAIEmbeddingProvider::new("sk-...")?.with_dimensions(512);
/// let vector = provider.embed("what slowed participants down?").await?;
/// assert_eq!(vector.len(), 512);
/// ```
pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
    /// Ask the API to shorten vectors to `dimensions`.
    truncate: bool,
}

impl std::fmt::Debug for OpenAIEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIEmbeddingProvider")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl OpenAIEmbeddingProvider {
    /// Provider for the default model and endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] for a blank key.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(RagError::ConfigError(format!("{API_KEY_VAR} must not be empty")));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            truncate: false,
        })
    }

    /// Provider configured from the process environment, or `None` when
    /// `OPENAI_API_KEY` is unset.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    ///
    /// Reads `OPENAI_API_KEY` plus the optional `STUDY_RAG_OPENAI_MODEL`,
    /// `STUDY_RAG_OPENAI_ENDPOINT` and `STUDY_RAG_OPENAI_DIMENSIONS`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let Some(api_key) = lookup(API_KEY_VAR) else {
            return Ok(None);
        };
        let mut provider = Self::new(api_key)?;
        if let Some(model) = lookup(&format!("{ENV_PREFIX}OPENAI_MODEL")) {
            provider = provider.with_model(model.trim());
        }
        if let Some(endpoint) = lookup(&format!("{ENV_PREFIX}OPENAI_ENDPOINT")) {
            provider = provider.with_endpoint(endpoint.trim());
        }
        let key = format!("{ENV_PREFIX}OPENAI_DIMENSIONS");
        if let Some(raw) = lookup(&key) {
            let dims = raw.trim().parse::<usize>().ok().filter(|&d| d > 0).ok_or_else(|| {
                RagError::ConfigError(format!("{key} has an invalid value '{raw}'"))
            })?;
            provider = provider.with_dimensions(dims);
        }
        Ok(Some(provider))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at another OpenAI-compatible embeddings endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Request vectors shortened to `dims` values.
    pub fn with_dimensions(mut self, dims: usize) -> Self {
        self.dimensions = dims;
        self.truncate = true;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn embedding_error(message: String) -> RagError {
    RagError::EmbeddingError { provider: PROVIDER.to_string(), message }
}

/// Map a non-success response to an error of the right retry class.
fn classify_failure(status: StatusCode, body: &str) -> RagError {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RagError::ConfigError(format!("{PROVIDER} rejected the API key: {detail}"))
        }
        StatusCode::NOT_FOUND => {
            RagError::ConfigError(format!("{PROVIDER} model or endpoint not found: {detail}"))
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            RagError::InvalidQuery(format!("{PROVIDER} refused the input: {detail}"))
        }
        _ => embedding_error(format!("{status}: {detail}")),
    }
}

/// Order vectors by input position and check count and size.
fn collect_vectors(
    mut items: Vec<EmbeddingItem>,
    expected: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>> {
    if items.len() != expected {
        return Err(embedding_error(format!(
            "expected {expected} embeddings, response holds {}",
            items.len()
        )));
    }
    items.sort_by_key(|item| item.index);
    items
        .into_iter()
        .enumerate()
        .map(|(position, item)| {
            if item.index != position {
                return Err(embedding_error(format!("missing embedding for input {position}")));
            }
            if item.embedding.len() != dimensions {
                return Err(embedding_error(format!(
                    "expected {dimensions} dimensions, got {}",
                    item.embedding.len()
                )));
            }
            Ok(item.embedding)
        })
        .collect()
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text]).await?;
        vectors.pop().ok_or_else(|| embedding_error("empty response".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            provider = PROVIDER,
            model = %self.model,
            batch_size = texts.len(),
            "requesting embeddings"
        );

        let request = EmbeddingsRequest {
            model: &self.model,
            input: texts,
            dimensions: self.truncate.then_some(self.dimensions),
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| embedding_error(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_failure(status, &body);
            warn!(
                provider = PROVIDER,
                %status,
                transient = err.is_transient(),
                "embedding request failed"
            );
            return Err(err);
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| embedding_error(format!("unreadable response: {e}")))?;
        collect_vectors(parsed.data, texts.len(), self.dimensions)
    }
}
