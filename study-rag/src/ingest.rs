//! Document ingestion: chunk → store → embed → attach.
//!
//! Ingestion lives beside the retrieval engine, which only ever reads the
//! chunk store. Chunks are stored first without embeddings; each embedding
//! is attached exactly once after generation. Any change to a study's
//! document set is reported to the [`StudyMutationNotifier`] so cached
//! metadata for that study is dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::{InvalidationOutcome, StudyMutationNotifier};
use crate::chunking::Chunker;
use crate::config::RagConfig;
use crate::document::DocumentInfo;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::inmemory::InMemoryChunkStore;
use crate::retry::{RetryPolicy, retry};
use crate::store::ChunkStore;

/// Summary of one ingested document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub document_id: String,
    pub chunk_count: usize,
    pub ingested_at: DateTime<Utc>,
    #[serde(skip)]
    pub invalidation: Option<InvalidationOutcome>,
}

/// Writes documents into an [`InMemoryChunkStore`].
pub struct DocumentIngestor {
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<InMemoryChunkStore>,
    notifier: Option<Arc<StudyMutationNotifier>>,
    retry: RetryPolicy,
}

impl DocumentIngestor {
    pub fn new(
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<InMemoryChunkStore>,
        config: &RagConfig,
    ) -> Self {
        Self {
            chunker,
            embedder,
            store,
            notifier: None,
            retry: RetryPolicy::fixed(config.retry_attempts, config.retry_delay()),
        }
    }

    /// Report document changes to this notifier.
    pub fn with_notifier(mut self, notifier: Arc<StudyMutationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    async fn notify(&self, study_id: &str) -> Option<InvalidationOutcome> {
        match &self.notifier {
            Some(notifier) => Some(notifier.on_documents_changed(study_id).await),
            None => None,
        }
    }

    /// Chunk, store and embed a document on behalf of `owner_id`.
    ///
    /// The first ingestion into a study makes `owner_id` its owner. Empty
    /// text stores a document with no chunks.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::StudyAccessDenied`] if another user owns the
    /// study, [`RagError::ChunkStoreError`] if the document already exists
    /// and [`RagError::EmbeddingError`] if embedding still fails after
    /// retries. In the last case the document stays stored with unembedded
    /// chunks, which searches skip.
    pub async fn ingest(
        &self,
        owner_id: &str,
        info: DocumentInfo,
        text: &str,
    ) -> Result<IngestReport> {
        self.store.register_study(&info.study_id, owner_id).await?;
        let chunks = self.chunker.chunk_document(&info.id, &info.name, text);
        let document_id = info.id.clone();
        let study_id = info.study_id.clone();
        let chunk_count = chunks.len();
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();

        self.store.insert_document(info, chunks).await?;
        let invalidation = self.notify(&study_id).await;

        if chunk_count > 0 {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            let embeddings =
                retry(self.retry, "embed_document", || self.embedder.embed_batch(&refs))
                    .await
                    .inspect_err(|e| {
                        error!(
                            document.id = %document_id,
                            error = %e,
                            "embedding failed during ingestion"
                        )
                    })?;
            if embeddings.len() != chunk_count {
                return Err(RagError::EmbeddingError {
                    provider: self.embedder.name().to_string(),
                    message: format!(
                        "expected {chunk_count} embeddings for document '{document_id}', got {}",
                        embeddings.len()
                    ),
                });
            }
            for (chunk_id, embedding) in ids.iter().zip(&embeddings) {
                self.store.attach_embedding(&document_id, chunk_id, embedding).await?;
            }
        }

        info!(document.id = %document_id, chunk_count, "ingested document");
        Ok(IngestReport { document_id, chunk_count, ingested_at: Utc::now(), invalidation })
    }

    /// Delete a document of a study owned by `user_id` and invalidate the
    /// study's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::NotFound`] if the document does not exist and
    /// [`RagError::StudyAccessDenied`] if `user_id` does not own its study.
    pub async fn delete(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Option<InvalidationOutcome>> {
        let info = self
            .store
            .document(document_id)
            .await
            .ok_or_else(|| RagError::NotFound(format!("document '{document_id}'")))?;
        let owner = self.store.study_owner(&info.study_id).await?;
        if owner.as_deref() != Some(user_id) {
            warn!(user_id, study_id = %info.study_id, document.id = %document_id, "delete denied");
            return Err(RagError::StudyAccessDenied {
                user_id: user_id.to_string(),
                study_id: info.study_id,
            });
        }
        self.store.delete_document(document_id).await;
        info!(document.id = %document_id, study_id = %info.study_id, "deleted document");
        Ok(self.notify(&info.study_id).await)
    }
}
