//! Error types for the `study-rag` crate.

use thiserror::Error;

/// Errors that can occur during retrieval and citation handling.
#[derive(Debug, Error)]
pub enum RagError {
    /// An error occurred during embedding generation.
    #[error("Embedding error ({provider}): {message}")]
    EmbeddingError {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// An error occurred in the chunk store backend.
    #[error("Chunk store error ({backend}): {message}")]
    ChunkStoreError {
        /// The chunk store backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// The query itself is unusable (empty, too long, ...).
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The call carried no usable scope.
    #[error("Missing scope: {0}")]
    MissingScope(String),

    /// The caller asked for documents outside the study it may search.
    #[error("Access denied: documents {document_ids:?} are not part of study '{study_id}'")]
    AccessDenied {
        /// The study the caller is scoped to.
        study_id: String,
        /// The requested document IDs that fall outside the study.
        document_ids: Vec<String>,
    },

    /// The caller does not own the study it asked for.
    #[error("Access denied: user '{user_id}' may not access study '{study_id}'")]
    StudyAccessDenied {
        /// The caller.
        user_id: String,
        /// The study the caller named.
        study_id: String,
    },

    /// A referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An embedding blob could not be decoded.
    #[error("Codec error: {0}")]
    CodecError(String),

    /// An error occurred during document chunking.
    #[error("Chunking error: {0}")]
    ChunkingError(String),

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The metadata cache could not complete an operation.
    #[error("Cache error: {0}")]
    CacheError(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,
}

impl RagError {
    /// Whether retrying the same call may succeed.
    ///
    /// Only failures of external collaborators (embedding service, chunk
    /// store) are transient. Validation and access errors fail immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, RagError::EmbeddingError { .. } | RagError::ChunkStoreError { .. })
    }
}

/// A convenience result type for retrieval operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_external_failures_are_transient() {
        let embed = RagError::EmbeddingError { provider: "mock".into(), message: "503".into() };
        let store = RagError::ChunkStoreError { backend: "mem".into(), message: "io".into() };
        assert!(embed.is_transient());
        assert!(store.is_transient());
        assert!(!RagError::InvalidQuery("empty".into()).is_transient());
        assert!(!RagError::MissingScope("study".into()).is_transient());
        assert!(
            !RagError::AccessDenied { study_id: "s".into(), document_ids: vec!["d".into()] }
                .is_transient()
        );
        assert!(
            !RagError::StudyAccessDenied { user_id: "u".into(), study_id: "s".into() }
                .is_transient()
        );
        assert!(!RagError::Cancelled.is_transient());
    }
}
