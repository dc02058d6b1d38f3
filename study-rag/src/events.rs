//! Structured events streamed to the client while a response is produced.
//!
//! Events are serialized with a `type` tag (`citations`, `tool-call-start`,
//! `tool-call-end`, `synthesis-progress`, `text-delta`, `done`, `error`).
//! [`EventEmitter`] pushes them over a bounded channel; a closed channel
//! means the client went away, which callers use to cancel work.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::citation::{Citation, CitationMap};

/// Stage reported by `synthesis-progress` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SynthesisStage {
    Searching,
    SearchComplete,
    SearchError,
    Grouping,
    Analyzing,
}

/// Counters and context attached to a progress event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An event delivered to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    Citations { citations: Vec<Citation> },
    ToolCallStart { tool_name: String },
    ToolCallEnd { tool_name: String, success: bool },
    SynthesisProgress { stage: SynthesisStage, progress: ProgressDetail },
    TextDelta { text: String },
    Done { citation_map: CitationMap },
    Error { message: String },
}

impl StreamEvent {
    pub fn progress(stage: SynthesisStage, progress: ProgressDetail) -> Self {
        StreamEvent::SynthesisProgress { stage, progress }
    }

    /// The `type` tag, used as the SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Citations { .. } => "citations",
            StreamEvent::ToolCallStart { .. } => "tool-call-start",
            StreamEvent::ToolCallEnd { .. } => "tool-call-end",
            StreamEvent::SynthesisProgress { .. } => "synthesis-progress",
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Sending half of a client event stream.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
}

/// Create an emitter and the receiver the transport drains.
pub fn event_channel(capacity: usize) -> (EventEmitter, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventEmitter { tx }, rx)
}

impl EventEmitter {
    /// Send an event. Returns `false` once the client has disconnected.
    pub async fn emit(&self, event: StreamEvent) -> bool {
        let kind = event.kind();
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                debug!(kind, "event dropped, client disconnected");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolve when the receiving side is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
