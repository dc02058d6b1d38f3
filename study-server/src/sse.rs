//! Streaming synthesis over Server-Sent Events.
//!
//! The handler authorizes the request up front, so scope errors still come
//! back as plain HTTP errors. Everything after that is streamed: retrieval
//! progress, the citation list numbered from the merged document groups,
//! then the cited passages as text deltas and a final `done` event carrying
//! the citation map. Each SSE event is named after the event's `type`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use serde::Deserialize;
use study_rag::{
    AuthorizedScope, CancellationToken, CitationRegistry, CitedResponseWriter, DocumentGroup,
    DocumentInfo, EventEmitter, ProgressDetail, RagError, RetrievalOutcome, RetrievalService,
    StreamEvent, SynthesisStage, event_channel,
};
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::handlers::ScopeParams;
use crate::state::AppState;

const EVENT_BUFFER: usize = 64;

pub const NO_RESULTS_MESSAGE: &str =
    "No relevant passages were found in the selected documents for these questions.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisBody {
    #[serde(flatten)]
    pub scope: ScopeParams,
    pub queries: Vec<String>,
}

/// POST /api/studies/{study_id}/synthesis
pub async fn synthesis_stream(
    Path(study_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<SynthesisBody>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if body.queries.iter().all(|q| q.trim().is_empty()) {
        return Err(ApiError::BadRequest("at least one non-empty query is required".into()));
    }
    let scope = body.scope.into_scope(study_id);
    let authorized = state.service.authorize(&scope).await?;
    let documents = state.service.study_documents(&scope).await?;

    let (emitter, mut rx) = event_channel(EVENT_BUFFER);
    tokio::spawn(run_synthesis(
        state.service.clone(),
        authorized,
        documents,
        body.queries,
        emitter,
    ));

    let stream = stream! {
        while let Some(event) = rx.recv().await {
            match Event::default().event(event.kind()).json_data(&event) {
                Ok(sse) => yield Ok(sse),
                Err(e) => warn!(kind = event.kind(), error = %e, "failed to encode stream event"),
            }
        }
    };

    let keep_alive = KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive");
    Ok(Sse::new(stream).keep_alive(keep_alive))
}

async fn run_synthesis(
    service: Arc<RetrievalService>,
    scope: AuthorizedScope,
    documents: Vec<DocumentInfo>,
    queries: Vec<String>,
    emitter: EventEmitter,
) {
    let cancel = CancellationToken::new();
    let watcher = {
        let emitter = emitter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            emitter.closed().await;
            cancel.cancel();
        })
    };

    let outcome =
        service.retriever().retrieve(&scope, &queries, Some(&cancel), Some(&emitter)).await;
    watcher.abort();

    match outcome {
        Ok(RetrievalOutcome::Found(batch)) => {
            let groups = batch.groups();
            emitter
                .emit(StreamEvent::progress(
                    SynthesisStage::Analyzing,
                    ProgressDetail {
                        result_count: Some(batch.results.len()),
                        document_count: Some(groups.len()),
                        ..Default::default()
                    },
                ))
                .await;

            let mut registry = CitationRegistry::new(documents);
            let citations = registry.number_groups(&groups);
            if !emitter.emit(StreamEvent::Citations { citations }).await {
                return;
            }

            let mut writer = CitedResponseWriter::new(registry, emitter);
            for delta in passage_deltas(&groups) {
                if !writer.push(&delta).await {
                    debug!(study_id = scope.study_id(), "client left during synthesis");
                    return;
                }
            }
            let citation_map = writer.finish().await;
            info!(
                study_id = scope.study_id(),
                citations = citation_map.len(),
                "synthesis streamed"
            );
        }
        Ok(RetrievalOutcome::NoResults { .. }) => {
            let mut writer = CitedResponseWriter::new(CitationRegistry::default(), emitter);
            if writer.push(NO_RESULTS_MESSAGE).await {
                writer.finish().await;
            }
        }
        Err(RagError::Cancelled) => {
            debug!(study_id = scope.study_id(), "synthesis cancelled");
        }
        Err(e) => {
            warn!(study_id = scope.study_id(), error = %e, "synthesis failed");
            emitter.emit(StreamEvent::Error { message: e.to_string() }).await;
        }
    }
}

/// Grouped passages as word-sized deltas, each group opened by its
/// `[Source: ...]` marker.
fn passage_deltas(groups: &[DocumentGroup]) -> Vec<String> {
    let mut text = String::new();
    for group in groups {
        text.push_str(&format!("[Source: {}]\n", group.document_name));
        for chunk in &group.chunks {
            text.push_str(&format!("- {}\n", chunk.content.trim()));
        }
        text.push('\n');
    }
    text.split_inclusive(' ').map(str::to_string).collect()
}
