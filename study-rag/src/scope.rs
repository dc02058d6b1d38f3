//! Access scope threaded through every retrieval call.
//!
//! A [`Scope`] is what the caller claims; an [`AuthorizedScope`] is what the
//! [`ScopeResolver`] has checked: the caller owns the study, and every
//! allowlisted document belongs to it. Search APIs only accept the latter,
//! so an unchecked scope cannot reach the chunk store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheKey, MetadataCache};
use crate::document::DocumentInfo;
use crate::error::{RagError, Result};
use crate::store::ChunkStore;

/// The study (and optionally the documents) a caller wants to search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub user_id: String,
    pub study_id: String,
    /// Optional allowlist; `None` means every document of the study.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<String>>,
}

impl Scope {
    /// Scope covering a whole study.
    pub fn study(user_id: impl Into<String>, study_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), study_id: study_id.into(), document_ids: None }
    }

    /// Restrict the scope to specific documents.
    pub fn with_documents<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Reject scopes that cannot identify anything to search.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::MissingScope`] for a blank user or study, or an
    /// empty document allowlist.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(RagError::MissingScope("user id is empty".into()));
        }
        if self.study_id.trim().is_empty() {
            return Err(RagError::MissingScope("study id is empty".into()));
        }
        if self.document_ids.as_ref().is_some_and(|ids| ids.is_empty()) {
            return Err(RagError::MissingScope("document allowlist is empty".into()));
        }
        Ok(())
    }
}

/// A scope whose owner and document allowlist have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedScope {
    scope: Scope,
}

impl AuthorizedScope {
    pub fn user_id(&self) -> &str {
        &self.scope.user_id
    }

    pub fn study_id(&self) -> &str {
        &self.scope.study_id
    }

    pub fn document_ids(&self) -> Option<&[String]> {
        self.scope.document_ids.as_deref()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Resolves and authorizes scopes, caching study document lists.
pub struct ScopeResolver {
    store: Arc<dyn ChunkStore>,
    cache: Arc<MetadataCache>,
}

impl ScopeResolver {
    pub fn new(store: Arc<dyn ChunkStore>, cache: Arc<MetadataCache>) -> Self {
        Self { store, cache }
    }

    /// Documents of a study, served from the metadata cache when fresh.
    ///
    /// A list read while the study was being invalidated is returned but not
    /// cached.
    pub async fn study_documents(&self, study_id: &str) -> Result<Vec<DocumentInfo>> {
        let key = CacheKey::study_documents(study_id);
        if let Some(docs) = self.cache.get_json::<Vec<DocumentInfo>>(&key) {
            debug!(study_id, "study documents served from cache");
            return Ok(docs);
        }
        let generation = self.cache.generation();
        let docs = self.store.list_documents(study_id).await?;
        self.cache.set_json_if_unchanged(&key, &docs, self.cache.default_ttl(), generation)?;
        Ok(docs)
    }

    /// Check a scope and produce an [`AuthorizedScope`].
    ///
    /// Runs before any embedding or search work.
    ///
    /// # Errors
    ///
    /// - [`RagError::MissingScope`] if the scope is blank.
    /// - [`RagError::StudyAccessDenied`] if the study is unknown or owned by
    ///   another user.
    /// - [`RagError::AccessDenied`] if the allowlist names documents that are
    ///   not part of the study.
    pub async fn authorize(&self, scope: &Scope) -> Result<AuthorizedScope> {
        scope.validate()?;

        let owner = self.store.study_owner(&scope.study_id).await?;
        if owner.as_deref() != Some(scope.user_id.as_str()) {
            warn!(
                user_id = %scope.user_id,
                study_id = %scope.study_id,
                known_study = owner.is_some(),
                "study access denied"
            );
            return Err(RagError::StudyAccessDenied {
                user_id: scope.user_id.clone(),
                study_id: scope.study_id.clone(),
            });
        }

        if let Some(requested) = &scope.document_ids {
            let docs = self.study_documents(&scope.study_id).await?;
            let outside: Vec<String> = requested
                .iter()
                .filter(|id| !docs.iter().any(|d| &d.id == *id))
                .cloned()
                .collect();
            if !outside.is_empty() {
                warn!(
                    user_id = %scope.user_id,
                    study_id = %scope.study_id,
                    denied = ?outside,
                    "document access outside study scope"
                );
                return Err(RagError::AccessDenied {
                    study_id: scope.study_id.clone(),
                    document_ids: outside,
                });
            }
        }

        Ok(AuthorizedScope { scope: scope.clone() })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::document::StoredChunk;
    use crate::inmemory::InMemoryChunkStore;

    async fn resolver() -> (ScopeResolver, Arc<InMemoryChunkStore>, Arc<MetadataCache>) {
        let store = Arc::new(InMemoryChunkStore::new());
        store.register_study("s1", "u").await.unwrap();
        store.register_study("s2", "other").await.unwrap();
        store
            .insert_document(
                DocumentInfo { id: "a".into(), study_id: "s1".into(), name: "A.pdf".into() },
                vec![],
            )
            .await
            .unwrap();
        store
            .insert_document(
                DocumentInfo { id: "x".into(), study_id: "s2".into(), name: "X.pdf".into() },
                vec![],
            )
            .await
            .unwrap();
        let cache = Arc::new(MetadataCache::new(Duration::from_secs(60), 100));
        (ScopeResolver::new(store.clone(), cache.clone()), store, cache)
    }

    #[tokio::test]
    async fn blank_scope_is_missing() {
        let (r, _, _) = resolver().await;
        let err = r.authorize(&Scope::study("u", " ")).await.unwrap_err();
        assert!(matches!(err, RagError::MissingScope(_)));
        let err = r.authorize(&Scope::study("u", "s1").with_documents(Vec::<String>::new())).await;
        assert!(matches!(err, Err(RagError::MissingScope(_))));
    }

    #[tokio::test]
    async fn foreign_documents_are_denied() {
        let (r, _, _) = resolver().await;
        let err = r.authorize(&Scope::study("u", "s1").with_documents(["a", "x"])).await;
        match err {
            Err(RagError::AccessDenied { document_ids, .. }) => assert_eq!(document_ids, vec!["x"]),
            other => panic!("expected access denied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn studies_of_other_users_are_denied_before_listing() {
        let (r, _, cache) = resolver().await;
        let err = r.authorize(&Scope::study("mallory", "s1")).await;
        assert!(matches!(
            err,
            Err(RagError::StudyAccessDenied { ref user_id, ref study_id })
                if user_id == "mallory" && study_id == "s1"
        ));
        let err = r.authorize(&Scope::study("u", "s2").with_documents(["x"])).await;
        assert!(matches!(err, Err(RagError::StudyAccessDenied { .. })));
        let err = r.authorize(&Scope::study("u", "nowhere")).await;
        assert!(matches!(err, Err(RagError::StudyAccessDenied { .. })));
        assert!(cache.is_empty());
    }

    /// Lists documents, then stalls before handing the list back.
    struct SlowListing {
        inner: Arc<InMemoryChunkStore>,
        stall: Duration,
    }

    #[async_trait]
    impl ChunkStore for SlowListing {
        fn backend(&self) -> &str {
            "SlowListing"
        }

        async fn study_owner(&self, study_id: &str) -> Result<Option<String>> {
            self.inner.study_owner(study_id).await
        }

        async fn list_documents(&self, study_id: &str) -> Result<Vec<DocumentInfo>> {
            let docs = self.inner.list_documents(study_id).await?;
            tokio::time::sleep(self.stall).await;
            Ok(docs)
        }

        async fn fetch_scoped_chunks(
            &self,
            study_id: &str,
            document_ids: Option<&[String]>,
        ) -> Result<Vec<StoredChunk>> {
            self.inner.fetch_scoped_chunks(study_id, document_ids).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn listing_that_races_an_invalidation_is_not_cached() {
        let (_, store, cache) = resolver().await;
        let slow = Arc::new(SlowListing { inner: store.clone(), stall: Duration::from_millis(50) });
        let r = ScopeResolver::new(slow, cache.clone());

        let mutate = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store
                .insert_document(
                    DocumentInfo { id: "b".into(), study_id: "s1".into(), name: "B.pdf".into() },
                    vec![],
                )
                .await
                .unwrap();
            cache.invalidate_pattern(&CacheKey::study_prefix("s1"));
        };
        let (stale, ()) = tokio::join!(r.study_documents("s1"), mutate);
        assert_eq!(stale.unwrap().len(), 1);
        assert!(cache.get(&CacheKey::study_documents("s1")).is_none());

        let scope = r.authorize(&Scope::study("u", "s1").with_documents(["b"])).await.unwrap();
        assert_eq!(scope.document_ids(), Some(&["b".to_string()][..]));
    }

    #[tokio::test]
    async fn own_documents_are_authorized() {
        let (r, _, cache) = resolver().await;
        let scope = r.authorize(&Scope::study("u", "s1").with_documents(["a"])).await.unwrap();
        assert_eq!(scope.study_id(), "s1");
        assert_eq!(scope.document_ids(), Some(&["a".to_string()][..]));
        assert!(cache.get(&CacheKey::study_documents("s1")).is_some());
    }
}
