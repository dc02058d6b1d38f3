//! # study-rag
//!
//! Retrieval and citation attribution for document-grounded study chat.
//!
//! ## Overview
//!
//! A query travels through:
//!
//! - [`ScopeResolver`] - checks the caller's [`Scope`] before any work runs
//! - [`VectorSearchEngine`] - embeds the query, scores every scoped chunk by
//!   cosine similarity, filters by threshold and ranks
//! - [`MultiQueryRetriever`] - runs several queries concurrently, then
//!   deduplicates, balances per document and caps the merged result
//! - [`CitationRegistry`] / [`StreamingCitationParser`] - turn
//!   `[Source: name]` markers into stable `[n]` citations
//! - [`EventEmitter`] - streams progress, citations and text to the client
//!
//! [`RetrievalService`] composes these, and [`ToolRegistry`] exposes the
//! `search_all_documents`, `search_specific_documents` and
//! `find_document_ids` tools to an LLM tool-call loop.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use study_rag::*;
//!
//! let store = Arc::new(InMemoryChunkStore::new());
//! store.register_study("study-1", "user-1").await?;
//! let service = Arc::new(
//!     RetrievalService::builder()
//!         .config(RagConfig::default())
//!         .embedding_provider(Arc::new(HashEmbedder::default()))
//!         .chunk_store(store.clone())
//!         .build()?,
//! );
//!
//! let scope = Scope::study("user-1", "study-1");
//! let hits = service.search(&scope, &SearchRequest::new("onboarding friction", 5, 0.3)).await?;
//! ```
//!
//! ## Features
//!
//! - `openai` - [`openai::OpenAIEmbeddingProvider`] over HTTP (reqwest)

pub mod cache;
pub mod cancel;
pub mod chunking;
pub mod citation;
pub mod codec;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod events;
pub mod ingest;
pub mod inmemory;
pub mod local;
pub mod orchestrator;
pub mod retry;
pub mod scope;
pub mod search;
pub mod service;
pub mod similarity;
pub mod store;
pub mod testing;
pub mod tools;

#[cfg(feature = "openai")]
pub mod openai;

pub use cache::{
    CacheEntry, CacheKey, InvalidationOutcome, MetadataCache, MetadataInvalidator,
    StudyMutationNotifier,
};
pub use cancel::CancellationToken;
pub use chunking::{Chunker, ChunkingOptions, TextChunk, TextChunker, normalize_line_endings};
pub use citation::{
    Citation, CitationMap, CitationRef, CitationRegistry, CitationStatus, CitedResponseWriter,
    MarkerMatch, RenderedText, StreamingCitationParser, ValidatedCitation, ValidatedCitations,
    render_citations, scan_citation_markers, validate_citations, validate_citations_text,
};
pub use codec::{decode_embedding, encode_embedding};
pub use config::{RagConfig, RagConfigBuilder};
pub use document::{
    Chunk, DocumentGroup, DocumentInfo, SearchResult, StoredChunk, group_by_document,
};
pub use embedding::{EmbeddingOutcome, EmbeddingProvider};
pub use error::{RagError, Result};
pub use events::{EventEmitter, ProgressDetail, StreamEvent, SynthesisStage, event_channel};
pub use ingest::{DocumentIngestor, IngestReport};
pub use inmemory::InMemoryChunkStore;
pub use local::HashEmbedder;
pub use orchestrator::{
    BatchOptions, MultiQueryRetriever, RetrievalBatch, RetrievalOutcome, StudySummarySearch,
    SubQueryReport, SubQueryStatus, SummaryRetrieval, balance_by_document, deduplicate,
};
pub use retry::{Backoff, RetryPolicy};
pub use scope::{AuthorizedScope, Scope, ScopeResolver};
pub use search::{SearchRequest, VectorSearchEngine};
pub use service::{NameResolution, RetrievalService, RetrievalServiceBuilder};
pub use similarity::cosine_similarity;
pub use store::ChunkStore;
pub use tools::{DocumentRef, RetrievalTool, ToolOutput, ToolRegistry};
