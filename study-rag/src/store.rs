//! Chunk store trait: the read-side query contract of chunk persistence.

use async_trait::async_trait;

use crate::document::{DocumentInfo, StoredChunk};
use crate::error::Result;

/// Read access to the chunks and documents of a study.
///
/// The retrieval engine never writes through this trait. Every query is
/// filtered by study inside the store, so a result can never contain chunks
/// of another study. Who may search a study at all is decided by
/// [`ChunkStore::study_owner`].
///
/// # Example
///
/// ```rust,ignore
/// use study_rag::{ChunkStore, InMemoryChunkStore};
///
/// let store = InMemoryChunkStore::new();
/// let candidates = store.fetch_scoped_chunks("study-1", Some(&["doc-a".into()])).await?;
/// ```
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Backend name used in logs and errors.
    fn backend(&self) -> &str;

    /// The user that owns a study, or `None` if the study is unknown.
    async fn study_owner(&self, study_id: &str) -> Result<Option<String>>;

    /// List every document owned by a study.
    async fn list_documents(&self, study_id: &str) -> Result<Vec<DocumentInfo>>;

    /// Fetch candidate chunks for a search.
    ///
    /// Only chunks that belong to documents of `study_id` and that carry an
    /// embedding are returned. When `document_ids` is `Some`, the result is
    /// further restricted to those documents; unknown IDs match nothing.
    async fn fetch_scoped_chunks(
        &self,
        study_id: &str,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<StoredChunk>>;

    /// Resolve document names to documents of a study.
    ///
    /// Matching is exact first, then case-insensitive. Names with no match
    /// are omitted from the result.
    async fn find_documents_by_name(
        &self,
        study_id: &str,
        names: &[String],
    ) -> Result<Vec<DocumentInfo>> {
        let documents = self.list_documents(study_id).await?;
        let mut found = Vec::new();
        for name in names {
            let hit = documents
                .iter()
                .find(|d| d.name == *name)
                .or_else(|| documents.iter().find(|d| d.name.eq_ignore_ascii_case(name)));
            if let Some(doc) = hit {
                if !found.iter().any(|f: &DocumentInfo| f.id == doc.id) {
                    found.push(doc.clone());
                }
            }
        }
        Ok(found)
    }
}
