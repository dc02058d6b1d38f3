//! Configuration for retrieval, chunking, caching and retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Environment variable prefix read by [`RagConfig::from_env`].
pub const ENV_PREFIX: &str = "STUDY_RAG_";

/// Configuration parameters for the retrieval engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    /// Target chunk size in characters.
    pub chunk_size: usize,
    /// Approximate number of overlapping characters between consecutive chunks.
    pub chunk_overlap: usize,
    /// Minimum chunk length; only the final chunk of a document may be shorter.
    pub min_chunk_size: usize,
    /// Prefer paragraph breaks over character offsets when splitting.
    pub preserve_paragraphs: bool,
    /// Number of results returned when the caller does not pass a limit.
    pub default_limit: usize,
    /// Upper bound on the limit a tool call may request.
    pub max_tool_limit: usize,
    /// Minimum cosine similarity for a chunk to be returned.
    pub min_similarity: f32,
    /// Maximum results kept per document in a multi-query batch.
    pub per_document_cap: usize,
    /// Maximum results returned by a multi-query batch.
    pub final_cap: usize,
    /// Number of leading characters compared when deduplicating results.
    pub dedup_prefix_chars: usize,
    /// Attempts for transient embedding / store failures.
    pub retry_attempts: u32,
    /// Fixed delay between those attempts.
    pub retry_delay_ms: u64,
    /// Default time-to-live for metadata cache entries.
    pub cache_ttl_ms: u64,
    /// Maximum number of metadata cache entries.
    pub cache_max_entries: usize,
    /// Attempts for cache invalidation.
    pub invalidation_attempts: u32,
    /// Base delay for the exponential invalidation backoff.
    pub invalidation_base_delay_ms: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 100,
            preserve_paragraphs: true,
            default_limit: 10,
            max_tool_limit: 15,
            min_similarity: 0.3,
            per_document_cap: 5,
            final_cap: 20,
            dedup_prefix_chars: 100,
            retry_attempts: 3,
            retry_delay_ms: 500,
            cache_ttl_ms: 300_000,
            cache_max_entries: 1000,
            invalidation_attempts: 3,
            invalidation_base_delay_ms: 100,
        }
    }
}

impl RagConfig {
    /// Create a new builder for constructing a [`RagConfig`].
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::default()
    }

    /// Load defaults overlaid with `STUDY_RAG_*` environment variables.
    ///
    /// Recognised variables are the upper-cased field names, e.g.
    /// `STUDY_RAG_CHUNK_SIZE` or `STUDY_RAG_MIN_SIMILARITY`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if a variable does not parse or the
    /// resulting configuration is inconsistent.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::builder();
        let c = &mut builder.config;

        overlay(&lookup, "CHUNK_SIZE", &mut c.chunk_size)?;
        overlay(&lookup, "CHUNK_OVERLAP", &mut c.chunk_overlap)?;
        overlay(&lookup, "MIN_CHUNK_SIZE", &mut c.min_chunk_size)?;
        overlay(&lookup, "PRESERVE_PARAGRAPHS", &mut c.preserve_paragraphs)?;
        overlay(&lookup, "DEFAULT_LIMIT", &mut c.default_limit)?;
        overlay(&lookup, "MAX_TOOL_LIMIT", &mut c.max_tool_limit)?;
        overlay(&lookup, "MIN_SIMILARITY", &mut c.min_similarity)?;
        overlay(&lookup, "PER_DOCUMENT_CAP", &mut c.per_document_cap)?;
        overlay(&lookup, "FINAL_CAP", &mut c.final_cap)?;
        overlay(&lookup, "DEDUP_PREFIX_CHARS", &mut c.dedup_prefix_chars)?;
        overlay(&lookup, "RETRY_ATTEMPTS", &mut c.retry_attempts)?;
        overlay(&lookup, "RETRY_DELAY_MS", &mut c.retry_delay_ms)?;
        overlay(&lookup, "CACHE_TTL_MS", &mut c.cache_ttl_ms)?;
        overlay(&lookup, "CACHE_MAX_ENTRIES", &mut c.cache_max_entries)?;
        overlay(&lookup, "INVALIDATION_ATTEMPTS", &mut c.invalidation_attempts)?;
        overlay(&lookup, "INVALIDATION_BASE_DELAY_MS", &mut c.invalidation_base_delay_ms)?;

        builder.build()
    }

    /// Fixed delay between retries of transient failures.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Default cache entry time-to-live.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Base delay of the invalidation backoff.
    pub fn invalidation_base_delay(&self) -> Duration {
        Duration::from_millis(self.invalidation_base_delay_ms)
    }
}

fn overlay<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) -> Result<()> {
    let key = format!("{ENV_PREFIX}{name}");
    if let Some(raw) = lookup(&key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| RagError::ConfigError(format!("{key} has an invalid value '{raw}'")))?;
    }
    Ok(())
}

/// Builder for constructing a validated [`RagConfig`].
#[derive(Debug, Clone, Default)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl RagConfigBuilder {
    /// Set the target chunk size in characters.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks in characters.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the minimum chunk size.
    pub fn min_chunk_size(mut self, size: usize) -> Self {
        self.config.min_chunk_size = size;
        self
    }

    /// Prefer paragraph boundaries when chunking.
    pub fn preserve_paragraphs(mut self, preserve: bool) -> Self {
        self.config.preserve_paragraphs = preserve;
        self
    }

    /// Set the default search limit.
    pub fn default_limit(mut self, limit: usize) -> Self {
        self.config.default_limit = limit;
        self
    }

    /// Set the minimum similarity threshold for filtering results.
    pub fn min_similarity(mut self, threshold: f32) -> Self {
        self.config.min_similarity = threshold;
        self
    }

    /// Set the per-document cap applied when balancing multi-query results.
    pub fn per_document_cap(mut self, cap: usize) -> Self {
        self.config.per_document_cap = cap;
        self
    }

    /// Set the final result cap of a multi-query batch.
    pub fn final_cap(mut self, cap: usize) -> Self {
        self.config.final_cap = cap;
        self
    }

    /// Set the number of attempts for transient failures.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    /// Set the fixed retry delay in milliseconds.
    pub fn retry_delay_ms(mut self, delay: u64) -> Self {
        self.config.retry_delay_ms = delay;
        self
    }

    /// Set the default cache TTL in milliseconds.
    pub fn cache_ttl_ms(mut self, ttl: u64) -> Self {
        self.config.cache_ttl_ms = ttl;
        self
    }

    /// Set the maximum number of cache entries.
    pub fn cache_max_entries(mut self, max: usize) -> Self {
        self.config.cache_max_entries = max;
        self
    }

    /// Build the [`RagConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if:
    /// - `chunk_size == 0` or `chunk_overlap >= chunk_size`
    /// - `min_chunk_size > chunk_size`
    /// - any limit or cap is zero
    /// - `min_similarity` is outside `[-1, 1]`
    /// - `retry_attempts` or `invalidation_attempts` is zero
    pub fn build(self) -> Result<RagConfig> {
        let c = &self.config;
        if c.chunk_size == 0 {
            return Err(RagError::ConfigError("chunk_size must be greater than zero".into()));
        }
        if c.chunk_overlap >= c.chunk_size {
            return Err(RagError::ConfigError(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                c.chunk_overlap, c.chunk_size
            )));
        }
        if c.min_chunk_size > c.chunk_size {
            return Err(RagError::ConfigError(format!(
                "min_chunk_size ({}) must not exceed chunk_size ({})",
                c.min_chunk_size, c.chunk_size
            )));
        }
        if c.default_limit == 0 || c.max_tool_limit == 0 {
            return Err(RagError::ConfigError("search limits must be greater than zero".into()));
        }
        if c.per_document_cap == 0 || c.final_cap == 0 {
            return Err(RagError::ConfigError("result caps must be greater than zero".into()));
        }
        if !(-1.0..=1.0).contains(&c.min_similarity) {
            return Err(RagError::ConfigError(format!(
                "min_similarity ({}) must be within [-1, 1]",
                c.min_similarity
            )));
        }
        if c.retry_attempts == 0 || c.invalidation_attempts == 0 {
            return Err(RagError::ConfigError("attempt counts must be at least one".into()));
        }
        if c.cache_max_entries == 0 {
            return Err(RagError::ConfigError("cache_max_entries must be greater than zero".into()));
        }
        Ok(self.config)
    }
}
