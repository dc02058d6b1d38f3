//! # study-server
//!
//! HTTP surface for the study retrieval engine: JSON endpoints for search,
//! the retrieval tools, document ingestion and citation validation, plus a
//! Server-Sent Events stream for multi-query synthesis.

pub mod error;
pub mod handlers;
pub mod server;
pub mod sse;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use server::{ServerConfig, app_router, run_server};
pub use state::{AppState, embedder_from_env};
