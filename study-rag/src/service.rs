//! Retrieval service: the composed engine behind tools and transports.
//!
//! [`RetrievalService`] wires a chunk store, an embedding provider and a
//! metadata cache into scope resolution, single-query search, multi-query
//! retrieval and the study-summary strategy. Every public method takes the
//! caller's [`Scope`] and authorizes it before any other work.
//!
//! # Example
//!
//! ```rust,ignore
//! use study_rag::{RetrievalService, RagConfig, InMemoryChunkStore};
//!
//! let service = RetrievalService::builder()
//!     .config(RagConfig::default())
//!     .embedding_provider(Arc::new(embedder))
//!     .chunk_store(Arc::new(InMemoryChunkStore::new()))
//!     .build()?;
//!
//! let scope = Scope::study("u1", "s1");
//! let hits = service.search(&scope, &SearchRequest::new("onboarding", 5, 0.5)).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::cache::{CacheKey, MetadataCache};
use crate::cancel::CancellationToken;
use crate::config::RagConfig;
use crate::document::{DocumentInfo, SearchResult};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::events::EventEmitter;
use crate::orchestrator::{
    BatchOptions, MultiQueryRetriever, RetrievalOutcome, StudySummarySearch, SummaryRetrieval,
};
use crate::scope::{AuthorizedScope, Scope, ScopeResolver};
use crate::search::{SearchRequest, VectorSearchEngine};
use crate::store::ChunkStore;

/// Result of resolving document names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameResolution {
    pub found: Vec<DocumentInfo>,
    pub unmatched: Vec<String>,
}

/// The composed retrieval engine. Construct one via
/// [`RetrievalService::builder()`].
pub struct RetrievalService {
    config: RagConfig,
    store: Arc<dyn ChunkStore>,
    cache: Arc<MetadataCache>,
    resolver: ScopeResolver,
    engine: Arc<VectorSearchEngine>,
    retriever: Arc<MultiQueryRetriever>,
}

impl RetrievalService {
    pub fn builder() -> RetrievalServiceBuilder {
        RetrievalServiceBuilder::default()
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn chunk_store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<VectorSearchEngine> {
        &self.engine
    }

    pub fn retriever(&self) -> &Arc<MultiQueryRetriever> {
        &self.retriever
    }

    /// Check a scope. See [`ScopeResolver::authorize`].
    pub async fn authorize(&self, scope: &Scope) -> Result<AuthorizedScope> {
        self.resolver.authorize(scope).await
    }

    /// Documents of the scope's study (cached).
    pub async fn study_documents(&self, scope: &Scope) -> Result<Vec<DocumentInfo>> {
        let scope = self.authorize(scope).await?;
        self.resolver.study_documents(scope.study_id()).await
    }

    /// Authorize, then run one vector search.
    ///
    /// # Errors
    ///
    /// Scope errors short-circuit before the query is embedded; see
    /// [`VectorSearchEngine::search`] for the rest.
    pub async fn search(
        &self,
        scope: &Scope,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>> {
        let scope = self.authorize(scope).await?;
        self.engine.search(&scope, request).await
    }

    /// Authorize, then run a concurrent multi-query batch.
    #[instrument(skip_all, fields(study_id = %scope.study_id))]
    pub async fn retrieve(
        &self,
        scope: &Scope,
        queries: &[String],
        cancel: Option<&CancellationToken>,
        events: Option<&EventEmitter>,
    ) -> Result<RetrievalOutcome> {
        let scope = self.authorize(scope).await?;
        self.retriever.retrieve(&scope, queries, cancel, events).await
    }

    /// Authorize, then run the context + detail summary queries.
    pub async fn study_summary(
        &self,
        scope: &Scope,
        cancel: Option<&CancellationToken>,
    ) -> Result<SummaryRetrieval> {
        let scope = self.authorize(scope).await?;
        StudySummarySearch::new(self.retriever.clone()).run(&scope, cancel).await
    }

    /// Resolve document names to IDs within the scope's study.
    ///
    /// Exact names win over case-insensitive matches. The name lookup is
    /// cached under `study:{id}:document-names`.
    pub async fn find_document_ids(
        &self,
        scope: &Scope,
        names: &[String],
    ) -> Result<NameResolution> {
        let scope = self.authorize(scope).await?;
        let study_id = scope.study_id();
        let generation = self.cache.generation();
        let documents = self.resolver.study_documents(study_id).await?;

        let key = CacheKey::study_document_names(study_id);
        let lookup: BTreeMap<String, String> = match self.cache.get_json(&key) {
            Some(lookup) => lookup,
            None => {
                let lookup: BTreeMap<String, String> =
                    documents.iter().map(|d| (d.name.clone(), d.id.clone())).collect();
                let ttl = self.cache.default_ttl();
                self.cache.set_json_if_unchanged(&key, &lookup, ttl, generation)?;
                lookup
            }
        };

        let mut resolution = NameResolution::default();
        for name in names {
            let name = name.trim();
            let lower = name.to_lowercase();
            let id = lookup.get(name).or_else(|| {
                lookup.iter().find(|(n, _)| n.to_lowercase() == lower).map(|(_, id)| id)
            });
            match id.and_then(|id| documents.iter().find(|d| &d.id == id)) {
                Some(doc) if !resolution.found.iter().any(|f| f.id == doc.id) => {
                    resolution.found.push(doc.clone())
                }
                Some(_) => {}
                None => resolution.unmatched.push(name.to_string()),
            }
        }
        debug!(
            found = resolution.found.len(),
            unmatched = resolution.unmatched.len(),
            "resolved document names"
        );
        Ok(resolution)
    }
}

/// Builder for [`RetrievalService`].
///
/// `embedding_provider` and `chunk_store` are required. Without an explicit
/// cache, one is created from the config.
#[derive(Default)]
pub struct RetrievalServiceBuilder {
    config: Option<RagConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    chunk_store: Option<Arc<dyn ChunkStore>>,
    cache: Option<Arc<MetadataCache>>,
}

impl RetrievalServiceBuilder {
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    pub fn chunk_store(mut self, store: Arc<dyn ChunkStore>) -> Self {
        self.chunk_store = Some(store);
        self
    }

    /// Share an existing metadata cache, e.g. with a mutation notifier.
    pub fn cache(mut self, cache: Arc<MetadataCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build the service.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if a required field is missing.
    pub fn build(self) -> Result<RetrievalService> {
        let config = self.config.unwrap_or_default();
        let embedding_provider = self
            .embedding_provider
            .ok_or_else(|| RagError::ConfigError("embedding_provider is required".to_string()))?;
        let store = self
            .chunk_store
            .ok_or_else(|| RagError::ConfigError("chunk_store is required".to_string()))?;
        let cache = self.cache.unwrap_or_else(|| Arc::new(MetadataCache::from_config(&config)));

        let engine = Arc::new(VectorSearchEngine::new(embedding_provider, store.clone(), &config));
        let retriever =
            Arc::new(MultiQueryRetriever::new(engine.clone(), BatchOptions::from(&config)));
        let resolver = ScopeResolver::new(store.clone(), cache.clone());

        info!(backend = store.backend(), "retrieval service ready");
        Ok(RetrievalService { config, store, cache, resolver, engine, retriever })
    }
}
