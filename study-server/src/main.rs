use study_rag::RagConfig;
use study_server::{AppState, ServerConfig, embedder_from_env, run_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    study_telemetry::init_telemetry("study-server");

    let config = RagConfig::from_env()?;
    let server = ServerConfig::from_env()?;
    let state = AppState::new(config, embedder_from_env()?)?;

    run_server(server, state).await
}
