//! Document chunking.
//!
//! [`TextChunker`] splits normalized text into overlapping windows. With
//! `preserve_paragraphs` set it cuts at blank-line paragraph breaks, then at
//! whitespace, and only as a last resort at a raw character offset.
//!
//! All sizes and positions are counted in characters (Unicode scalar values),
//! not bytes.

use serde::{Deserialize, Serialize};

use crate::config::RagConfig;
use crate::document::Chunk;
use crate::error::{RagError, Result};

/// Options controlling [`TextChunker`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingOptions {
    /// Target maximum chunk length.
    pub chunk_size: usize,
    /// Approximate overlap carried from one chunk into the next.
    pub overlap_size: usize,
    /// Minimum length of every chunk except the last one.
    pub min_chunk_size: usize,
    /// Prefer blank-line paragraph breaks as cut points.
    pub preserve_paragraphs: bool,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self::from(&RagConfig::default())
    }
}

impl From<&RagConfig> for ChunkingOptions {
    fn from(config: &RagConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            overlap_size: config.chunk_overlap,
            min_chunk_size: config.min_chunk_size,
            preserve_paragraphs: config.preserve_paragraphs,
        }
    }
}

impl ChunkingOptions {
    /// Check the options are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ChunkingError`] if `chunk_size` is zero,
    /// `overlap_size >= chunk_size` or `min_chunk_size > chunk_size`.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::ChunkingError("chunk_size must be greater than zero".into()));
        }
        if self.overlap_size >= self.chunk_size {
            return Err(RagError::ChunkingError(format!(
                "overlap_size ({}) must be less than chunk_size ({})",
                self.overlap_size, self.chunk_size
            )));
        }
        if self.min_chunk_size > self.chunk_size {
            return Err(RagError::ChunkingError(format!(
                "min_chunk_size ({}) must not exceed chunk_size ({})",
                self.min_chunk_size, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A chunk of normalized text with its character span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TextChunk {
    pub content: String,
    pub chunk_index: usize,
    /// Inclusive start, in characters of the normalized text.
    pub start_position: usize,
    /// Exclusive end, in characters of the normalized text.
    pub end_position: usize,
}

/// A strategy for splitting text into chunks.
pub trait Chunker: Send + Sync {
    /// Split text into chunks.
    ///
    /// Returns an empty `Vec` for empty or whitespace-only input.
    fn chunk_text(&self, text: &str) -> Vec<TextChunk>;

    /// Split a document into [`Chunk`]s without embeddings.
    ///
    /// Chunk IDs are generated as `{document_id}_{chunk_index}`.
    fn chunk_document(&self, document_id: &str, document_name: &str, text: &str) -> Vec<Chunk> {
        self.chunk_text(text)
            .into_iter()
            .map(|c| Chunk {
                id: format!("{document_id}_{}", c.chunk_index),
                document_id: document_id.to_string(),
                document_name: document_name.to_string(),
                content: c.content,
                chunk_index: c.chunk_index,
                embedding: None,
            })
            .collect()
    }
}

/// Replace CRLF and lone CR line endings with LF.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Paragraph-aware sliding-window chunker.
///
/// # Example
///
/// ```rust,ignore
/// use study_rag::{ChunkingOptions, TextChunker, Chunker};
///
/// let chunker = TextChunker::new(ChunkingOptions::default())?;
/// let chunks = chunker.chunk_text(&text);
/// ```
#[derive(Debug, Clone)]
pub struct TextChunker {
    options: ChunkingOptions,
}

impl TextChunker {
    /// Create a chunker, validating the options.
    pub fn new(options: ChunkingOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &ChunkingOptions {
        &self.options
    }
}

/// Character view over normalized text: chars plus their byte offsets.
struct CharText<'a> {
    text: &'a str,
    chars: Vec<char>,
    offsets: Vec<usize>,
}

impl<'a> CharText<'a> {
    fn new(text: &'a str) -> Self {
        let (offsets, chars) = text.char_indices().unzip();
        Self { text, chars, offsets }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn slice(&self, start: usize, end: usize) -> &'a str {
        let from = self.offsets.get(start).copied().unwrap_or(self.text.len());
        let to = self.offsets.get(end).copied().unwrap_or(self.text.len());
        &self.text[from..to]
    }

    fn is_space(&self, pos: usize) -> bool {
        self.chars[pos].is_whitespace()
    }

    /// Last paragraph break (`\n` followed by optional blank space and
    /// another `\n`) whose first newline lies in `lo..=hi`. Returns the
    /// position of that first newline.
    fn last_paragraph_break(&self, lo: usize, hi: usize) -> Option<usize> {
        let mut pos = hi.min(self.len().saturating_sub(1));
        while pos >= lo {
            if self.chars[pos] == '\n' {
                let mut next = pos + 1;
                while next < self.len() && self.chars[next] != '\n' && self.is_space(next) {
                    next += 1;
                }
                if next < self.len() && self.chars[next] == '\n' {
                    return Some(pos);
                }
            }
            if pos == 0 {
                break;
            }
            pos -= 1;
        }
        None
    }

    /// Last whitespace position in `lo..=hi`.
    fn last_whitespace(&self, lo: usize, hi: usize) -> Option<usize> {
        let hi = hi.min(self.len().saturating_sub(1));
        (lo..=hi).rev().find(|&p| self.is_space(p))
    }

    /// First start-of-word position in `lo..hi`.
    fn first_word_start(&self, lo: usize, hi: usize) -> Option<usize> {
        (lo..hi).find(|&p| !self.is_space(p) && (p == 0 || self.is_space(p - 1)))
    }

    fn skip_whitespace(&self, mut pos: usize) -> usize {
        while pos < self.len() && self.is_space(pos) {
            pos += 1;
        }
        pos
    }
}

impl TextChunker {
    /// Choose the exclusive end of a chunk starting at `start`.
    fn cut_point(&self, text: &CharText<'_>, start: usize) -> usize {
        let n = text.len();
        let target = (start + self.options.chunk_size).min(n);
        if target == n {
            return n;
        }

        // Cuts before `lo` would leave a chunk shorter than min_chunk_size.
        let lo = start + self.options.min_chunk_size.max(1);
        if lo > target {
            return target;
        }

        if self.options.preserve_paragraphs {
            if let Some(pos) = text.last_paragraph_break(lo, target) {
                return pos;
            }
        }
        text.last_whitespace(lo, target).unwrap_or(target)
    }

    /// Start of the chunk following one spanning `start..end`.
    fn next_start(&self, text: &CharText<'_>, start: usize, end: usize) -> usize {
        let overlap = self.options.overlap_size.min((end - start) / 2);
        if overlap > 0 {
            if let Some(pos) = text.first_word_start(end - overlap, end) {
                return pos;
            }
        }
        text.skip_whitespace(end)
    }
}

impl Chunker for TextChunker {
    fn chunk_text(&self, text: &str) -> Vec<TextChunk> {
        let normalized = normalize_line_endings(text);
        if normalized.trim().is_empty() {
            return Vec::new();
        }

        let text = CharText::new(&normalized);
        let n = text.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < n {
            let end = self.cut_point(&text, start);
            chunks.push(TextChunk {
                content: text.slice(start, end).to_string(),
                chunk_index: chunks.len(),
                start_position: start,
                end_position: end,
            });

            if end >= n {
                break;
            }
            let next = self.next_start(&text, start, end);
            if next >= n {
                break;
            }
            start = next;
        }

        chunks
    }
}
