//! Bounded TTL cache for scope and document metadata.
//!
//! [`MetadataCache`] is constructed explicitly and shared through an `Arc`;
//! there is no process-global instance. All mutation happens under a single
//! mutex, so concurrent requests racing on the same key observe a consistent
//! map.
//!
//! Expiry is lazy: a `get` that finds an expired entry deletes it and reports
//! a miss. [`MetadataCache::cleanup`] purges expired entries in bulk. Once the
//! cache holds `max_entries`, inserting a new key evicts the least recently
//! used entry.
//!
//! Every removal that is not an expiry bumps the cache generation. A caller
//! that fills an entry from a slower source reads [`MetadataCache::generation`]
//! first and writes with [`MetadataCache::set_if_unchanged`], so a value
//! loaded before a concurrent invalidation is never cached.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::retry::{RetryPolicy, retry_any};

/// Builders for the cache keys used by the engine.
pub struct CacheKey;

impl CacheKey {
    /// Documents of a study, as used by scope resolution.
    pub fn study_documents(study_id: &str) -> String {
        format!("study:{study_id}:documents")
    }

    /// Name → id lookup of a study's documents.
    pub fn study_document_names(study_id: &str) -> String {
        format!("study:{study_id}:document-names")
    }

    /// Pattern matching every key derived from a study.
    pub fn study_prefix(study_id: &str) -> String {
        format!("study:{study_id}:*")
    }
}

/// A cached value with its insertion time and time-to-live.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub inserted_at: Instant,
    pub ttl: Duration,
    recency: u64,
}

impl<T> CacheEntry<T> {
    /// An entry is expired once `ttl` has fully elapsed; a zero TTL expires
    /// immediately.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.inserted_at + self.ttl
    }
}

#[derive(Debug)]
struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// recency sequence → key, oldest first
    recency: BTreeMap<u64, String>,
    next_seq: u64,
    generation: u64,
}

impl<T> Default for CacheState<T> {
    fn default() -> Self {
        Self { entries: HashMap::new(), recency: BTreeMap::new(), next_seq: 0, generation: 0 }
    }
}

impl<T> CacheState<T> {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.recency);
        Some(entry)
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn store(&mut self, key: String, value: T, ttl: Duration, max_entries: usize) {
        if self.remove(&key).is_none() && self.entries.len() >= max_entries {
            if let Some(evicted) = self.evict_least_recent() {
                debug!(key = %evicted, "cache entry evicted");
            }
        }
        let seq = self.bump();
        self.recency.insert(seq, key.clone());
        let entry = CacheEntry { data: value, inserted_at: Instant::now(), ttl, recency: seq };
        self.entries.insert(key, entry);
    }
}

/// A bounded, TTL-based metadata cache.
///
/// The value type defaults to `serde_json::Value`, so one cache can hold
/// every kind of derived study metadata and a single pattern invalidation
/// drops all of it.
///
/// # Example
///
/// ```rust,ignore
/// use std::time::Duration;
/// use study_rag::MetadataCache;
///
/// let cache = MetadataCache::new(Duration::from_secs(300), 1000);
/// cache.set_json("study:42:documents", &docs, Duration::from_secs(60))?;
/// let removed = cache.invalidate_pattern("study:42:*");
/// ```
#[derive(Debug)]
pub struct MetadataCache<T = serde_json::Value> {
    state: Mutex<CacheState<T>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl<T: Clone> MetadataCache<T> {
    /// Create a cache with a default TTL and a maximum entry count.
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Create a cache sized from the engine configuration.
    pub fn from_config(config: &RagConfig) -> Self {
        Self::new(config.cache_ttl(), config.cache_max_entries)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        // A panic while holding the lock cannot leave a half-applied map
        // mutation behind, so the state is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a value. Expired entries are deleted and reported as a miss.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut state = self.lock();
        let now = Instant::now();
        let expired = state.entries.get(key)?.is_expired(now);
        if expired {
            state.remove(key);
            debug!(key, "cache entry expired");
            return None;
        }

        let seq = state.bump();
        let entry = state.entries.get_mut(key)?;
        let old = std::mem::replace(&mut entry.recency, seq);
        let data = entry.data.clone();
        state.recency.remove(&old);
        state.recency.insert(seq, key.to_string());
        Some(data)
    }

    /// Insert a value with an explicit TTL.
    ///
    /// Inserting a new key into a full cache first evicts the least recently
    /// used entry.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Duration) {
        self.lock().store(key.into(), value, ttl, self.max_entries);
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Insert a value unless an invalidation happened since `generation`
    /// was read. Returns whether the value was stored.
    pub fn set_if_unchanged(
        &self,
        key: impl Into<String>,
        value: T,
        ttl: Duration,
        generation: u64,
    ) -> bool {
        let key = key.into();
        let mut state = self.lock();
        if state.generation != generation {
            debug!(key = %key, "skipping cache fill that raced with an invalidation");
            return false;
        }
        state.store(key, value, ttl, self.max_entries);
        true
    }

    /// Insert a value with the cache's default TTL.
    pub fn insert(&self, key: impl Into<String>, value: T) {
        self.set(key, value, self.default_ttl);
    }

    /// Remove a single key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.lock();
        state.generation += 1;
        state.remove(key).is_some()
    }

    /// Remove every key matching a glob pattern (`*` and `?` wildcards).
    ///
    /// # Errors
    ///
    /// Returns [`RagError::CacheError`] if the pattern cannot be compiled.
    pub fn try_invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let matcher = glob_to_regex(pattern)?;
        let mut state = self.lock();
        state.generation += 1;
        let keys: Vec<String> =
            state.entries.keys().filter(|k| matcher.is_match(k)).cloned().collect();
        for key in &keys {
            state.remove(key);
        }
        debug!(pattern, removed = keys.len(), "cache pattern invalidated");
        Ok(keys.len())
    }

    /// Remove every key matching a glob pattern, returning the count.
    ///
    /// An uncompilable pattern removes nothing.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.try_invalidate_pattern(pattern).unwrap_or(0)
    }

    /// Purge all expired entries, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut state = self.lock();
        let now = Instant::now();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        let generation = state.generation + 1;
        *state = CacheState { generation, ..CacheState::default() };
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataCache<serde_json::Value> {
    /// Typed read of a JSON-backed entry. A value of the wrong shape is a miss.
    pub fn get_json<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Typed write of a JSON-backed entry.
    pub fn set_json<V: Serialize>(&self, key: &str, value: &V, ttl: Duration) -> Result<()> {
        let json = serde_json::to_value(value)
            .map_err(|e| RagError::CacheError(format!("failed to serialize '{key}': {e}")))?;
        self.set(key, json, ttl);
        Ok(())
    }

    /// [`MetadataCache::set_if_unchanged`] for a JSON-backed entry.
    pub fn set_json_if_unchanged<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool> {
        let json = serde_json::to_value(value)
            .map_err(|e| RagError::CacheError(format!("failed to serialize '{key}': {e}")))?;
        Ok(self.set_if_unchanged(key, json, ttl, generation))
    }

    /// Default TTL configured for this cache.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

/// Compile a key glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    expr.push_str(&regex::escape(&literal));
    expr.push('$');
    Regex::new(&expr).map_err(|e| RagError::CacheError(format!("invalid pattern '{pattern}': {e}")))
}

/// Something that can drop cached metadata by key pattern.
#[async_trait]
pub trait MetadataInvalidator: Send + Sync {
    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize>;
}

#[async_trait]
impl<T: Clone + Send> MetadataInvalidator for MetadataCache<T> {
    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        self.try_invalidate_pattern(pattern)
    }
}

/// Result of invalidating a study's cached metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationOutcome {
    Invalidated { removed: usize },
    Failed { attempts: u32, error: String },
}

/// Drops derived metadata whenever a study's documents change.
///
/// Invalidation is retried with exponential backoff. A final failure is
/// logged and returned, never raised, so the mutation that triggered it
/// still completes.
pub struct StudyMutationNotifier {
    invalidator: Arc<dyn MetadataInvalidator>,
    policy: RetryPolicy,
}

impl StudyMutationNotifier {
    pub fn new(invalidator: Arc<dyn MetadataInvalidator>, policy: RetryPolicy) -> Self {
        Self { invalidator, policy }
    }

    pub fn from_config(invalidator: Arc<dyn MetadataInvalidator>, config: &RagConfig) -> Self {
        Self::new(
            invalidator,
            RetryPolicy::exponential(
                config.invalidation_attempts,
                config.invalidation_base_delay(),
            ),
        )
    }

    /// Invalidate everything cached under `study:{study_id}:*`.
    pub async fn on_documents_changed(&self, study_id: &str) -> InvalidationOutcome {
        let pattern = CacheKey::study_prefix(study_id);
        let result = retry_any(self.policy, "cache_invalidation", || {
            self.invalidator.invalidate_pattern(&pattern)
        })
        .await;

        match result {
            Ok(removed) => {
                info!(study_id, removed, "study metadata invalidated");
                InvalidationOutcome::Invalidated { removed }
            }
            Err(e) => {
                error!(
                    study_id,
                    attempts = self.policy.attempts,
                    error = %e,
                    "cache invalidation failed, metadata may be stale"
                );
                InvalidationOutcome::Failed { attempts: self.policy.attempts, error: e.to_string() }
            }
        }
    }
}
