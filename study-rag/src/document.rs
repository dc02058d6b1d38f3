//! Data types for documents, chunks, search results and document groups.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A document registered in a study.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    /// Unique identifier for the document.
    pub id: String,
    /// The study that owns the document.
    pub study_id: String,
    /// The user-visible file name, e.g. `interview-03.pdf`.
    pub name: String,
}

impl DocumentInfo {
    /// A new document with a generated ID.
    pub fn new(study_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4().to_string(), study_id: study_id.into(), name: name.into() }
    }
}

/// A bounded span of a document's text, the atomic unit of retrieval.
///
/// Chunks are immutable once created. The embedding is attached once after
/// generation and never replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Unique identifier for the chunk.
    pub id: String,
    /// The ID of the parent document.
    pub document_id: String,
    /// The parent document's name.
    pub document_name: String,
    /// The text content of the chunk.
    pub content: String,
    /// Position of the chunk within its document, starting at 0.
    pub chunk_index: usize,
    /// The vector embedding for this chunk's text, if generated yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A chunk as the store hands it out: the embedding is still encoded.
///
/// See [`crate::codec`] for the blob format.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub id: String,
    pub document_id: String,
    pub document_name: String,
    pub content: String,
    pub chunk_index: usize,
    pub embedding: Option<Vec<u8>>,
}

/// A retrieved chunk paired with its similarity to the query.
///
/// Produced fresh per query and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub content: String,
    /// Cosine similarity in `[-1, 1]` (higher is more relevant).
    pub similarity: f32,
    pub chunk_index: usize,
}

impl SearchResult {
    /// Build a result from a stored chunk and its score.
    pub fn from_stored(chunk: StoredChunk, similarity: f32) -> Self {
        Self {
            chunk_id: chunk.id,
            document_id: chunk.document_id,
            document_name: chunk.document_name,
            content: chunk.content,
            similarity,
            chunk_index: chunk.chunk_index,
        }
    }

    /// Similarity formatted as a whole percentage, e.g. `87%`.
    pub fn similarity_percent(&self) -> String {
        format!("{:.0}%", self.similarity * 100.0)
    }
}

/// Descending-similarity comparator. Equal scores compare equal so that a
/// stable sort keeps their relative order.
pub fn by_similarity_desc(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.similarity.partial_cmp(&a.similarity).unwrap_or(Ordering::Equal)
}

/// All results of one document, best match first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentGroup {
    pub document_id: String,
    pub document_name: String,
    pub chunks: Vec<SearchResult>,
}

impl DocumentGroup {
    /// Highest similarity in the group, or `-1.0` for an empty group.
    pub fn best_similarity(&self) -> f32 {
        self.chunks.first().map(|c| c.similarity).unwrap_or(-1.0)
    }
}

/// Group results by document.
///
/// Chunks inside each group are sorted by similarity (descending); groups are
/// ordered by their best chunk, ties keeping first-seen order.
pub fn group_by_document(results: Vec<SearchResult>) -> Vec<DocumentGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, DocumentGroup> = HashMap::new();

    for result in results {
        let group = groups.entry(result.document_id.clone()).or_insert_with(|| {
            order.push(result.document_id.clone());
            DocumentGroup {
                document_id: result.document_id.clone(),
                document_name: result.document_name.clone(),
                chunks: Vec::new(),
            }
        });
        group.chunks.push(result);
    }

    let mut grouped: Vec<DocumentGroup> = order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .map(|mut group| {
            group.chunks.sort_by(by_similarity_desc);
            group
        })
        .collect();

    grouped.sort_by(|a, b| {
        b.best_similarity().partial_cmp(&a.best_similarity()).unwrap_or(Ordering::Equal)
    });
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(doc: &str, chunk: usize, similarity: f32) -> SearchResult {
        SearchResult {
            chunk_id: format!("{doc}_{chunk}"),
            document_id: doc.to_string(),
            document_name: format!("{doc}.pdf"),
            content: format!("content {doc} {chunk}"),
            similarity,
            chunk_index: chunk,
        }
    }

    #[test]
    fn groups_sorted_by_best_chunk() {
        let groups = group_by_document(vec![
            result("a", 0, 0.4),
            result("b", 0, 0.9),
            result("a", 1, 0.7),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].document_id, "b");
        assert_eq!(groups[1].document_id, "a");
        let sims: Vec<f32> = groups[1].chunks.iter().map(|c| c.similarity).collect();
        assert_eq!(sims, vec![0.7, 0.4]);
    }

    #[test]
    fn percent_formatting_rounds() {
        assert_eq!(result("a", 0, 0.876).similarity_percent(), "88%");
    }
}
