//! Citation extraction, numbering and validation.
//!
//! Inline markers look like `[Source: Interview 3.pdf]`. Handling them is
//! split in two phases:
//!
//! 1. [`scan_citation_markers`] finds markers in *completed* text and
//!    returns their positions and document names.
//! 2. [`render_citations`] resolves those matches through a
//!    [`CitationRegistry`] and replaces them with `[n]`.
//!
//! [`StreamingCitationParser`] feeds streamed text deltas through both
//! phases, holding back only a trailing fragment that could still grow into
//! a marker. Structured (LLM-produced) citation lists go through
//! [`validate_citations`] instead.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::document::{DocumentGroup, DocumentInfo};
use crate::events::{EventEmitter, StreamEvent};

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[source:\s*([^\]\n]+?)\s*\]")
        .expect("unreachable error: citation marker pattern is valid")
});

const MARKER_KEYWORD: &str = "source:";

/// Longest fragment held back while waiting for a marker to close.
const MAX_PENDING_CHARS: usize = 256;

/// Label shown for citations whose document is gone.
pub const MISSING_DOCUMENT_LABEL: &str = "document does not exist";

/// A numbered reference to a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub citation_number: u32,
    pub document_id: String,
    pub document_name: String,
}

/// Persisted value of one citation map entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationRef {
    pub document_id: String,
    pub document_name: String,
}

/// Citation number → document, persisted with a chat message.
///
/// Serializes as `{"1": {"documentId": .., "documentName": ..}, ..}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CitationMap(BTreeMap<u32, CitationRef>);

impl CitationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, citation: &Citation) {
        self.0.insert(
            citation.citation_number,
            CitationRef {
                document_id: citation.document_id.clone(),
                document_name: citation.document_name.clone(),
            },
        );
    }

    pub fn get(&self, number: u32) -> Option<&CitationRef> {
        self.0.get(&number)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries as citations, ordered by number.
    pub fn citations(&self) -> Vec<Citation> {
        self.0
            .iter()
            .map(|(number, r)| Citation {
                citation_number: *number,
                document_id: r.document_id.clone(),
                document_name: r.document_name.clone(),
            })
            .collect()
    }
}

impl FromIterator<Citation> for CitationMap {
    fn from_iter<I: IntoIterator<Item = Citation>>(iter: I) -> Self {
        let mut map = CitationMap::new();
        for citation in iter {
            map.insert(&citation);
        }
        map
    }
}

/// One inline marker found in completed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerMatch {
    /// Byte offset of `[`.
    pub start: usize,
    /// Byte offset just past `]`.
    pub end: usize,
    /// Trimmed document name inside the marker.
    pub document_name: String,
}

/// Find every citation marker in `text`, in order of appearance.
pub fn scan_citation_markers(text: &str) -> Vec<MarkerMatch> {
    MARKER
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?;
            Some(MarkerMatch {
                start: whole.start(),
                end: whole.end(),
                document_name: name.as_str().trim().to_string(),
            })
        })
        .collect()
}

/// Document-name lookup plus first-appearance citation numbering for one
/// response.
///
/// A document keeps the number it first received; numbers start at 1 and
/// are never reused for another document.
#[derive(Debug, Clone, Default)]
pub struct CitationRegistry {
    documents: Vec<DocumentInfo>,
    by_name: HashMap<String, usize>,
    by_lower_name: HashMap<String, usize>,
    numbers: HashMap<String, u32>,
    assigned: Vec<Citation>,
}

impl CitationRegistry {
    /// Build the name lookup from the documents a response may cite.
    pub fn new(documents: impl IntoIterator<Item = DocumentInfo>) -> Self {
        let mut registry = Self::default();
        for doc in documents {
            registry.add_document(doc);
        }
        registry
    }

    /// Lookup over the documents present in retrieval groups.
    pub fn from_groups(groups: &[DocumentGroup]) -> Self {
        Self::new(groups.iter().map(|g| DocumentInfo {
            id: g.document_id.clone(),
            study_id: String::new(),
            name: g.document_name.clone(),
        }))
    }

    /// Make another document citable. Existing names keep their mapping.
    pub fn add_document(&mut self, doc: DocumentInfo) {
        if self.documents.iter().any(|d| d.id == doc.id) {
            return;
        }
        let index = self.documents.len();
        self.by_name.entry(doc.name.clone()).or_insert(index);
        self.by_lower_name.entry(doc.name.to_lowercase()).or_insert(index);
        self.documents.push(doc);
    }

    fn lookup(&self, name: &str) -> Option<&DocumentInfo> {
        let name = name.trim();
        self.by_name
            .get(name)
            .or_else(|| self.by_lower_name.get(&name.to_lowercase()))
            .map(|&i| &self.documents[i])
    }

    /// Resolve a document name, assigning the next number on first use.
    ///
    /// Returns the citation and whether it was newly assigned, or `None`
    /// for a name that matches no known document.
    pub fn resolve(&mut self, document_name: &str) -> Option<(Citation, bool)> {
        let doc = self.lookup(document_name)?.clone();
        Some(self.number_document(&doc.id, &doc.name))
    }

    fn number_document(&mut self, document_id: &str, document_name: &str) -> (Citation, bool) {
        if let Some(&number) = self.numbers.get(document_id) {
            let existing = self.assigned[(number - 1) as usize].clone();
            return (existing, false);
        }
        let number = self.assigned.len() as u32 + 1;
        let citation = Citation {
            citation_number: number,
            document_id: document_id.to_string(),
            document_name: document_name.to_string(),
        };
        self.numbers.insert(document_id.to_string(), number);
        self.assigned.push(citation.clone());
        (citation, true)
    }

    /// Number documents in the order of already-merged retrieval groups.
    pub fn number_groups(&mut self, groups: &[DocumentGroup]) -> Vec<Citation> {
        groups
            .iter()
            .map(|g| {
                self.add_document(DocumentInfo {
                    id: g.document_id.clone(),
                    study_id: String::new(),
                    name: g.document_name.clone(),
                });
                self.number_document(&g.document_id, &g.document_name).0
            })
            .collect()
    }

    pub fn number_of(&self, document_id: &str) -> Option<u32> {
        self.numbers.get(document_id).copied()
    }

    /// Citations assigned so far, in number order.
    pub fn citations(&self) -> &[Citation] {
        &self.assigned
    }

    pub fn citation_map(&self) -> CitationMap {
        self.assigned.iter().cloned().collect()
    }
}

/// Output of rendering a piece of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedText {
    pub text: String,
    /// Citations first assigned while rendering this text.
    pub new_citations: Vec<Citation>,
}

/// Replace resolvable markers with `[n]`; unknown names stay verbatim.
///
/// `markers` must come from [`scan_citation_markers`] over the same `text`.
pub fn render_citations(
    text: &str,
    markers: &[MarkerMatch],
    registry: &mut CitationRegistry,
) -> RenderedText {
    let mut rendered =
        RenderedText { text: String::with_capacity(text.len()), new_citations: Vec::new() };
    let mut cursor = 0;
    for marker in markers {
        if marker.start < cursor || marker.end > text.len() {
            continue;
        }
        rendered.text.push_str(&text[cursor..marker.start]);
        match registry.resolve(&marker.document_name) {
            Some((citation, is_new)) => {
                rendered.text.push_str(&format!("[{}]", citation.citation_number));
                if is_new {
                    rendered.new_citations.push(citation);
                }
            }
            None => {
                debug!(
                    document_name = %marker.document_name,
                    "unresolved citation marker left as text"
                );
                rendered.text.push_str(&text[marker.start..marker.end]);
            }
        }
        cursor = marker.end;
    }
    rendered.text.push_str(&text[cursor..]);
    rendered
}

/// Whether `tail` (starting at `[`) could still become a marker.
fn could_become_marker(tail: &str) -> bool {
    let Some(rest) = tail.strip_prefix('[') else {
        return false;
    };
    if rest.contains(']') || rest.contains('\n') || rest.chars().count() > MAX_PENDING_CHARS {
        return false;
    }
    let lower = rest.to_lowercase();
    MARKER_KEYWORD.starts_with(lower.as_str()) || lower.starts_with(MARKER_KEYWORD)
}

/// Incremental marker resolution over streamed text deltas.
///
/// # Example
///
/// ```rust,ignore
/// let mut parser = StreamingCitationParser::new(CitationRegistry::new(docs));
/// let a = parser.push("Users struggled [Sou");
/// let b = parser.push("rce: A.pdf] with setup.");
/// let rest = parser.finish();
/// assert_eq!(format!("{}{}{}", a.text, b.text, rest.text), "Users struggled [1] with setup.");
/// ```
#[derive(Debug, Clone, Default)]
pub struct StreamingCitationParser {
    registry: CitationRegistry,
    pending: String,
}

impl StreamingCitationParser {
    pub fn new(registry: CitationRegistry) -> Self {
        Self { registry, pending: String::new() }
    }

    /// Add a delta and return the text that is now safe to show.
    ///
    /// Text is held back from the earliest `[` that could still open a
    /// marker, so a bracket inside a document name does not release the
    /// marker around it.
    pub fn push(&mut self, delta: &str) -> RenderedText {
        self.pending.push_str(delta);
        let split = self
            .pending
            .match_indices('[')
            .map(|(i, _)| i)
            .find(|&i| could_become_marker(&self.pending[i..]))
            .unwrap_or(self.pending.len());
        let held = self.pending.split_off(split);
        let ready = std::mem::replace(&mut self.pending, held);
        self.render(&ready)
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> RenderedText {
        let rest = std::mem::take(&mut self.pending);
        self.render(&rest)
    }

    fn render(&mut self, text: &str) -> RenderedText {
        if text.is_empty() {
            return RenderedText::default();
        }
        let markers = scan_citation_markers(text);
        render_citations(text, &markers, &mut self.registry)
    }

    pub fn registry(&self) -> &CitationRegistry {
        &self.registry
    }

    pub fn citation_map(&self) -> CitationMap {
        self.registry.citation_map()
    }
}

/// Streams an answer to the client with its citations.
///
/// A `citations` event carrying newly numbered documents is always sent
/// before the text that first references them, and the final `done` event
/// carries the complete citation map.
pub struct CitedResponseWriter {
    parser: StreamingCitationParser,
    emitter: EventEmitter,
}

impl CitedResponseWriter {
    pub fn new(registry: CitationRegistry, emitter: EventEmitter) -> Self {
        Self { parser: StreamingCitationParser::new(registry), emitter }
    }

    /// Forward one model delta. Returns `false` once the client is gone.
    pub async fn push(&mut self, delta: &str) -> bool {
        let rendered = self.parser.push(delta);
        self.send(rendered).await
    }

    /// Flush held text and send `done`. Returns the persisted citation map.
    pub async fn finish(mut self) -> CitationMap {
        let rendered = self.parser.finish();
        self.send(rendered).await;
        let citation_map = self.parser.citation_map();
        self.emitter.emit(StreamEvent::Done { citation_map: citation_map.clone() }).await;
        citation_map
    }

    async fn send(&self, rendered: RenderedText) -> bool {
        if !rendered.new_citations.is_empty() {
            let event = StreamEvent::Citations { citations: rendered.new_citations };
            if !self.emitter.emit(event).await {
                return false;
            }
        }
        if rendered.text.is_empty() {
            return !self.emitter.is_closed();
        }
        self.emitter.emit(StreamEvent::TextDelta { text: rendered.text }).await
    }
}

/// Whether a validated citation still points at an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CitationStatus {
    Valid,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedCitation {
    #[serde(flatten)]
    pub citation: Citation,
    pub status: CitationStatus,
}

impl ValidatedCitation {
    /// Name to show the user.
    pub fn display_name(&self) -> &str {
        match self.status {
            CitationStatus::Valid => &self.citation.document_name,
            CitationStatus::Missing => MISSING_DOCUMENT_LABEL,
        }
    }
}

/// Result of structured citation validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidatedCitations {
    /// Surviving citations, ordered by number.
    pub citations: Vec<ValidatedCitation>,
    /// Records filtered out as malformed or conflicting.
    pub dropped: usize,
}

impl ValidatedCitations {
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }

    pub fn missing(&self) -> impl Iterator<Item = &ValidatedCitation> {
        self.citations.iter().filter(|c| c.status == CitationStatus::Missing)
    }

    pub fn citation_map(&self) -> CitationMap {
        self.citations.iter().map(|c| c.citation.clone()).collect()
    }
}

fn non_empty_str<'a>(record: &'a Value, field: &str) -> Option<&'a str> {
    record.get(field)?.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Validate a citation list produced in structured synthesis mode.
///
/// Accepts either an array of records or an object with a `citations`
/// array. Each record needs non-empty string `documentId` and
/// `documentName`; `citationNumber`, when present, must be a positive
/// integer, otherwise the next free number is assigned. Malformed records,
/// repeats of an already cited document and numbers already taken by a
/// different document are dropped. Documents not in `known` are kept with
/// [`CitationStatus::Missing`]. Never fails: unusable input yields no
/// citations.
pub fn validate_citations(raw: &Value, known: &[DocumentInfo]) -> ValidatedCitations {
    let records = match raw {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => match obj.get("citations") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => {
                warn!("citation payload has no citations array");
                return ValidatedCitations::default();
            }
        },
        _ => {
            warn!("citation payload is neither an array nor an object");
            return ValidatedCitations::default();
        }
    };

    let known_ids: HashSet<&str> = known.iter().map(|d| d.id.as_str()).collect();
    let mut out = ValidatedCitations::default();
    let mut by_number: BTreeMap<u32, ValidatedCitation> = BTreeMap::new();
    let mut cited: HashSet<String> = HashSet::new();

    for record in records {
        let (Some(document_id), Some(document_name)) =
            (non_empty_str(record, "documentId"), non_empty_str(record, "documentName"))
        else {
            warn!(record = %record, "dropping malformed citation record");
            out.dropped += 1;
            continue;
        };

        let number = match record.get("citationNumber") {
            None | Some(Value::Null) => None,
            Some(n) => match n.as_u64().and_then(|n| u32::try_from(n).ok()).filter(|&n| n >= 1) {
                Some(n) => Some(n),
                None => {
                    warn!(record = %record, "dropping citation with invalid number");
                    out.dropped += 1;
                    continue;
                }
            },
        };

        if cited.contains(document_id) {
            debug!(document_id, "skipping repeated citation of the same document");
            out.dropped += 1;
            continue;
        }
        let number = match number {
            Some(n) if by_number.contains_key(&n) => {
                warn!(
                    citation_number = n,
                    document_id,
                    "citation number already used by another document"
                );
                out.dropped += 1;
                continue;
            }
            Some(n) => n,
            None => by_number.keys().next_back().map_or(1, |max| max + 1),
        };

        let status = if known_ids.contains(document_id) {
            CitationStatus::Valid
        } else {
            CitationStatus::Missing
        };
        cited.insert(document_id.to_string());
        by_number.insert(
            number,
            ValidatedCitation {
                citation: Citation {
                    citation_number: number,
                    document_id: document_id.to_string(),
                    document_name: document_name.to_string(),
                },
                status,
            },
        );
    }

    out.citations = by_number.into_values().collect();
    out
}

fn extract_json_from_markdown(text: &str) -> Option<&str> {
    let start_markers = ["```json\n", "```json\r\n", "```\n", "```\r\n"];
    for start in start_markers {
        if let Some(start_idx) = text.find(start) {
            let content_start = start_idx + start.len();
            if let Some(end_idx) = text[content_start..].find("```") {
                return Some(text[content_start..content_start + end_idx].trim());
            }
        }
    }
    None
}

/// Pull a JSON citation payload out of model output.
///
/// Tries the whole text, then a fenced code block.
pub fn extract_citation_payload(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }
    let fenced = extract_json_from_markdown(text)?;
    serde_json::from_str(fenced).ok()
}

/// [`extract_citation_payload`] then [`validate_citations`]; degrades to
/// no citations.
pub fn validate_citations_text(text: &str, known: &[DocumentInfo]) -> ValidatedCitations {
    match extract_citation_payload(text) {
        Some(value) => validate_citations(&value, known),
        None => {
            warn!("no citation payload found in model output");
            ValidatedCitations::default()
        }
    }
}
