//! Embedding provider trait for generating vector embeddings from text.

use async_trait::async_trait;

use crate::error::{RagError, Result};

/// The outcome of a single embedding call.
///
/// Callers match on the variant; a failed call never carries a vector.
#[derive(Debug)]
pub enum EmbeddingOutcome {
    /// The service returned a vector.
    Embedded(Vec<f32>),
    /// The service failed.
    Failed(RagError),
}

impl EmbeddingOutcome {
    /// Convert into a `Result`, treating an empty vector as a provider error.
    pub fn into_result(self, provider: &str) -> Result<Vec<f32>> {
        match self {
            EmbeddingOutcome::Embedded(v) if v.is_empty() => Err(RagError::EmbeddingError {
                provider: provider.to_string(),
                message: "provider returned an empty vector".into(),
            }),
            EmbeddingOutcome::Embedded(v) => Ok(v),
            EmbeddingOutcome::Failed(e) => Err(e),
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, EmbeddingOutcome::Embedded(_))
    }
}

impl From<Result<Vec<f32>>> for EmbeddingOutcome {
    fn from(result: Result<Vec<f32>>) -> Self {
        match result {
            Ok(v) => EmbeddingOutcome::Embedded(v),
            Err(e) => EmbeddingOutcome::Failed(e),
        }
    }
}

/// A provider that generates vector embeddings from text input.
///
/// Implementations wrap a specific embedding backend behind a unified async
/// interface. The default [`embed_batch`](EmbeddingProvider::embed_batch)
/// implementation calls [`embed`](EmbeddingProvider::embed) sequentially;
/// backends that support native batching should override it.
///
/// # Example
///
/// ```rust,ignore
/// use study_rag::EmbeddingProvider;
///
/// let provider = MyEmbeddingProvider::new();
/// match provider.embed_outcome("hello world").await {
///     EmbeddingOutcome::Embedded(v) => assert_eq!(v.len(), provider.dimensions()),
///     EmbeddingOutcome::Failed(e) => eprintln!("{e}"),
/// }
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short provider name used in logs and errors.
    fn name(&self) -> &str;

    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate an embedding and wrap the result in an [`EmbeddingOutcome`].
    async fn embed_outcome(&self, text: &str) -> EmbeddingOutcome {
        self.embed(text).await.into()
    }

    /// Generate embedding vectors for a batch of text inputs.
    ///
    /// The default implementation calls [`embed`](EmbeddingProvider::embed)
    /// sequentially for each input.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;
}
