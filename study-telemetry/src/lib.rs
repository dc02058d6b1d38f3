//! Tracing setup for the study retrieval services.
//!
//! - [`init_telemetry`]: human-readable output filtered by `RUST_LOG`
//!   (default `info`).
//! - [`init_json_telemetry`]: one JSON object per line, for production.
//! - [`init_with_env_filter`]: explicit filter directives.
//! - [`capture_subscriber`]: an in-memory subscriber for tests that assert
//!   on emitted events.
//!
//! Initialisation is idempotent; only the first call installs a global
//! subscriber.

mod capture;

pub use capture::{CapturedEvent, CapturedEvents, EventCaptureLayer};

use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a human-readable subscriber filtered by `RUST_LOG`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_telemetry(service_name: &str) -> bool {
    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(service.name = service_name, "telemetry initialized");
    }
    installed
}

/// Install a JSON subscriber filtered by `RUST_LOG`.
pub fn init_json_telemetry(service_name: &str) -> bool {
    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_current_span(true).with_span_list(false))
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(service.name = service_name, "telemetry initialized (json)");
    }
    installed
}

/// Install a human-readable subscriber with explicit filter directives,
/// e.g. `"study_rag=debug,info"`.
pub fn init_with_env_filter(directives: &str) -> bool {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).try_init().is_ok()
}

/// A subscriber that records every event into `storage`.
///
/// Intended for scoped use with `tracing::subscriber::set_default`.
pub fn capture_subscriber(storage: CapturedEvents) -> impl Subscriber + Send + Sync {
    tracing_subscriber::registry().with(EventCaptureLayer::new(storage))
}
