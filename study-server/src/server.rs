use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::handlers;
use crate::sse;
use crate::state::AppState;

pub const ADDR_ENV: &str = "STUDY_SERVER_ADDR";
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
}

impl ServerConfig {
    /// Bind address from `STUDY_SERVER_ADDR`, falling back to `127.0.0.1:8080`.
    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var(ADDR_ENV).unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let addr = raw.parse().with_context(|| format!("invalid {ADDR_ENV} '{raw}'"))?;
        Ok(Self { addr })
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/tools", get(handlers::list_tools))
        .route(
            "/api/studies/{study_id}/documents",
            get(handlers::list_documents).post(handlers::ingest_document),
        )
        .route("/api/studies/{study_id}/documents/resolve", post(handlers::resolve_document_names))
        .route("/api/documents/{document_id}", delete(handlers::delete_document))
        .route("/api/studies/{study_id}/search", post(handlers::search))
        .route("/api/studies/{study_id}/summary", post(handlers::study_summary))
        .route("/api/studies/{study_id}/tools/{name}", post(handlers::call_tool))
        .route("/api/studies/{study_id}/citations/validate", post(handlers::validate_citations))
        .route("/api/studies/{study_id}/synthesis", post(sse::synthesis_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub async fn run_server(config: ServerConfig, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!(addr = %config.addr, "study-server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
