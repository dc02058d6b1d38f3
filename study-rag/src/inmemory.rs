//! In-memory chunk store.
//!
//! This module provides [`InMemoryChunkStore`], a chunk store backed by
//! `HashMap`s protected by a `tokio::sync::RwLock`. It is suitable for
//! development, testing, and small single-process deployments. Embeddings
//! are kept in their encoded form, exactly as a database column would.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::codec::encode_embedding;
use crate::document::{Chunk, DocumentInfo, StoredChunk};
use crate::error::{RagError, Result};
use crate::store::ChunkStore;

const BACKEND: &str = "InMemory";

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<String, DocumentInfo>,
    /// document ID → chunks ordered by `chunk_index`
    chunks: HashMap<String, Vec<StoredChunk>>,
    /// study ID → owning user ID
    owners: HashMap<String, String>,
}

/// An in-memory chunk store.
///
/// # Example
///
/// ```rust,ignore
/// use study_rag::InMemoryChunkStore;
///
/// let store = InMemoryChunkStore::new();
/// store.register_study("study-1", "user-1").await?;
/// store.insert_document(info, chunks).await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryChunkStore {
    inner: RwLock<Inner>,
}

impl InMemoryChunkStore {
    /// Create a new empty in-memory chunk store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner_id` as the owner of a study.
    ///
    /// Registering the current owner again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::StudyAccessDenied`] if another user already owns
    /// the study.
    pub async fn register_study(&self, study_id: &str, owner_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.owners.get(study_id) {
            Some(owner) if owner != owner_id => Err(RagError::StudyAccessDenied {
                user_id: owner_id.to_string(),
                study_id: study_id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                inner.owners.insert(study_id.to_string(), owner_id.to_string());
                Ok(())
            }
        }
    }

    /// Register a document together with its chunks.
    ///
    /// Chunk indices must be unique and strictly increasing. Chunks that
    /// already carry an embedding are stored encoded.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ChunkStoreError`] if the document already exists,
    /// a chunk belongs to another document, or indices are out of order.
    pub async fn insert_document(&self, info: DocumentInfo, chunks: Vec<Chunk>) -> Result<()> {
        let mut stored = Vec::with_capacity(chunks.len());
        let mut last_index: Option<usize> = None;
        for chunk in chunks {
            if chunk.document_id != info.id {
                return Err(store_error(format!(
                    "chunk '{}' belongs to '{}', not '{}'",
                    chunk.id, chunk.document_id, info.id
                )));
            }
            if last_index.is_some_and(|last| chunk.chunk_index <= last) {
                return Err(store_error(format!(
                    "chunk indices of '{}' must be strictly increasing",
                    info.id
                )));
            }
            last_index = Some(chunk.chunk_index);
            stored.push(StoredChunk {
                id: chunk.id,
                document_id: chunk.document_id,
                document_name: info.name.clone(),
                content: chunk.content,
                chunk_index: chunk.chunk_index,
                embedding: chunk.embedding.as_deref().map(encode_embedding),
            });
        }

        let mut inner = self.inner.write().await;
        if inner.documents.contains_key(&info.id) {
            return Err(store_error(format!("document '{}' already exists", info.id)));
        }
        inner.chunks.insert(info.id.clone(), stored);
        inner.documents.insert(info.id.clone(), info);
        Ok(())
    }

    /// Attach an embedding to a chunk that does not have one yet.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::NotFound`] for an unknown chunk and
    /// [`RagError::ChunkStoreError`] if the chunk is already embedded.
    pub async fn attach_embedding(
        &self,
        document_id: &str,
        chunk_id: &str,
        embedding: &[f32],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let chunk = inner
            .chunks
            .get_mut(document_id)
            .and_then(|chunks| chunks.iter_mut().find(|c| c.id == chunk_id))
            .ok_or_else(|| RagError::NotFound(format!("chunk '{chunk_id}'")))?;
        if chunk.embedding.is_some() {
            return Err(store_error(format!("chunk '{chunk_id}' is already embedded")));
        }
        chunk.embedding = Some(encode_embedding(embedding));
        Ok(())
    }

    /// Store a raw (possibly corrupt) embedding blob. Intended for tests of
    /// decode failure handling.
    pub async fn attach_raw_embedding(
        &self,
        document_id: &str,
        chunk_id: &str,
        blob: Vec<u8>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let chunk = inner
            .chunks
            .get_mut(document_id)
            .and_then(|chunks| chunks.iter_mut().find(|c| c.id == chunk_id))
            .ok_or_else(|| RagError::NotFound(format!("chunk '{chunk_id}'")))?;
        chunk.embedding = Some(blob);
        Ok(())
    }

    /// Remove a document and its chunks. Returns whether it existed.
    pub async fn delete_document(&self, document_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.chunks.remove(document_id);
        inner.documents.remove(document_id).is_some()
    }

    /// Look up a single document.
    pub async fn document(&self, document_id: &str) -> Option<DocumentInfo> {
        self.inner.read().await.documents.get(document_id).cloned()
    }
}

fn store_error(message: String) -> RagError {
    RagError::ChunkStoreError { backend: BACKEND.to_string(), message }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn study_owner(&self, study_id: &str) -> Result<Option<String>> {
        Ok(self.inner.read().await.owners.get(study_id).cloned())
    }

    async fn list_documents(&self, study_id: &str) -> Result<Vec<DocumentInfo>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<DocumentInfo> =
            inner.documents.values().filter(|d| d.study_id == study_id).cloned().collect();
        docs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn fetch_scoped_chunks(
        &self,
        study_id: &str,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<StoredChunk>> {
        let inner = self.inner.read().await;

        let mut doc_ids: Vec<&String> = inner
            .documents
            .values()
            .filter(|d| d.study_id == study_id)
            .filter(|d| document_ids.is_none_or(|allowed| allowed.contains(&d.id)))
            .map(|d| &d.id)
            .collect();
        // Stable candidate order keeps equal scores in a predictable order.
        doc_ids.sort();

        Ok(doc_ids
            .into_iter()
            .filter_map(|id| inner.chunks.get(id))
            .flatten()
            .filter(|c| c.embedding.is_some())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, study: &str, name: &str) -> DocumentInfo {
        DocumentInfo { id: id.into(), study_id: study.into(), name: name.into() }
    }

    fn chunk(doc: &str, index: usize, embedding: Option<Vec<f32>>) -> Chunk {
        Chunk {
            id: format!("{doc}_{index}"),
            document_id: doc.into(),
            document_name: String::new(),
            content: format!("chunk {index} of {doc}"),
            chunk_index: index,
            embedding,
        }
    }

    #[tokio::test]
    async fn scoped_fetch_never_crosses_studies() {
        let store = InMemoryChunkStore::new();
        store
            .insert_document(info("a", "s1", "A.pdf"), vec![chunk("a", 0, Some(vec![1.0]))])
            .await
            .unwrap();
        store
            .insert_document(info("b", "s2", "B.pdf"), vec![chunk("b", 0, Some(vec![1.0]))])
            .await
            .unwrap();

        let s1 = store.fetch_scoped_chunks("s1", None).await.unwrap();
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].document_id, "a");
        assert_eq!(s1[0].document_name, "A.pdf");

        let cross = store.fetch_scoped_chunks("s1", Some(&["b".to_string()])).await.unwrap();
        assert!(cross.is_empty());
    }

    #[tokio::test]
    async fn unembedded_chunks_are_not_candidates() {
        let store = InMemoryChunkStore::new();
        store
            .insert_document(
                info("a", "s1", "A.pdf"),
                vec![chunk("a", 0, None), chunk("a", 1, Some(vec![0.5, 0.5]))],
            )
            .await
            .unwrap();
        let got = store.fetch_scoped_chunks("s1", None).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].chunk_index, 1);
    }

    #[tokio::test]
    async fn embeddings_are_append_only() {
        let store = InMemoryChunkStore::new();
        store.insert_document(info("a", "s1", "A.pdf"), vec![chunk("a", 0, None)]).await.unwrap();
        store.attach_embedding("a", "a_0", &[1.0, 0.0]).await.unwrap();
        let again = store.attach_embedding("a", "a_0", &[0.0, 1.0]).await;
        assert!(matches!(again, Err(RagError::ChunkStoreError { .. })));
    }

    #[tokio::test]
    async fn rejects_out_of_order_indices() {
        let store = InMemoryChunkStore::new();
        let err = store
            .insert_document(
                info("a", "s1", "A.pdf"),
                vec![chunk("a", 1, None), chunk("a", 1, None)],
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn studies_keep_their_first_owner() {
        let store = InMemoryChunkStore::new();
        assert_eq!(store.study_owner("s1").await.unwrap(), None);
        store.register_study("s1", "alice").await.unwrap();
        store.register_study("s1", "alice").await.unwrap();
        let taken = store.register_study("s1", "mallory").await;
        assert!(matches!(taken, Err(RagError::StudyAccessDenied { .. })));
        assert_eq!(store.study_owner("s1").await.unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn finds_documents_by_name_case_insensitively() {
        let store = InMemoryChunkStore::new();
        store.insert_document(info("a", "s1", "Interview.pdf"), vec![]).await.unwrap();
        store.insert_document(info("b", "s2", "Other.pdf"), vec![]).await.unwrap();
        let found = store
            .find_documents_by_name("s1", &["interview.PDF".into(), "Other.pdf".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }
}
