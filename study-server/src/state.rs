use std::sync::Arc;

use study_rag::{
    ChunkingOptions, DocumentIngestor, EmbeddingProvider, HashEmbedder, InMemoryChunkStore,
    MetadataCache, RagConfig, Result, RetrievalService, StudyMutationNotifier, TextChunker,
    ToolRegistry,
};
use tracing::info;

/// Shared handles for every request.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RetrievalService>,
    pub tools: Arc<ToolRegistry>,
    pub ingestor: Arc<DocumentIngestor>,
    pub store: Arc<InMemoryChunkStore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").field("tools", &self.tools.names()).finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire an in-memory store, the metadata cache and the ingestion path
    /// around one embedding provider.
    ///
    /// Ingestion and retrieval share the cache, so adding or deleting a
    /// document drops the study's cached metadata.
    pub fn new(config: RagConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let store = Arc::new(InMemoryChunkStore::new());
        let cache: Arc<MetadataCache> = Arc::new(MetadataCache::from_config(&config));

        let service = Arc::new(
            RetrievalService::builder()
                .config(config.clone())
                .embedding_provider(embedder.clone())
                .chunk_store(store.clone())
                .cache(cache.clone())
                .build()?,
        );

        let chunker = Arc::new(TextChunker::new(ChunkingOptions::from(&config))?);
        let notifier = Arc::new(StudyMutationNotifier::from_config(cache, &config));
        let ingestor = DocumentIngestor::new(chunker, embedder, store.clone(), &config);
        let ingestor = Arc::new(ingestor.with_notifier(notifier));
        let tools = Arc::new(ToolRegistry::standard(service.clone()));

        Ok(Self { service, tools, ingestor, store })
    }
}

/// Embedding provider for the server binary.
///
/// With the `openai` feature and `OPENAI_API_KEY` set, embeddings come from
/// the OpenAI API. Otherwise the offline hashing embedder is used.
pub fn embedder_from_env() -> Result<Arc<dyn EmbeddingProvider>> {
    embedder_from_lookup(|key| std::env::var(key).ok())
}

/// Same as [`embedder_from_env`] with an injectable lookup.
pub fn embedder_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn EmbeddingProvider>> {
    if let Some(remote) = remote_embedder(&lookup)? {
        return Ok(remote);
    }
    info!("using offline hashing embeddings");
    Ok(Arc::new(HashEmbedder::default()))
}

#[cfg(feature = "openai")]
fn remote_embedder(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    let Some(provider) = study_rag::openai::OpenAIEmbeddingProvider::from_lookup(lookup)? else {
        return Ok(None);
    };
    info!(model = provider.model(), endpoint = provider.endpoint(), "using OpenAI embeddings");
    Ok(Some(Arc::new(provider)))
}

#[cfg(not(feature = "openai"))]
fn remote_embedder(
    _lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    Ok(None)
}
