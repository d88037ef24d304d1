mod admin;
mod error;
mod logging;
mod orchestrator;
mod state;
mod warmup;
mod ws;

use axum::routing::{get, post};
use axum::Router;
use bridge_core::config::{default_config_path, load_config};
use bridge_core::peer::heartbeat;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use state::SharedBridge;

#[derive(Parser)]
#[command(name = "arena-bridge")]
#[command(about = "OpenAI-compatible bridge that delegates chat completions to a single browser tab")]
struct Cli {
    /// Path to the JSONC config file
    #[arg(long, env = "BRIDGE_CONFIG_PATH")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("arena_bridge=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path).map_err(anyhow::Error::msg)?;
    let host = config.host.clone();
    let port = config.port;

    let bridge = state::Bridge::new(config)?;

    spawn_background_tasks(&bridge);

    let app = build_router(bridge);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    tracing::info!(%host, port, "arena-bridge listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_background_tasks(bridge: &SharedBridge) {
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let heartbeat_link = bridge.peer.clone();
    let heartbeat_tracker = bridge.heartbeat_tracker.clone();
    tokio::spawn(async move {
        heartbeat::run(heartbeat_link, heartbeat_tracker, events_tx).await;
    });
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                heartbeat::HeartbeatEvent::MissedPong { consecutive_misses } => {
                    tracing::warn!(consecutive_misses, "peer missed a heartbeat pong");
                }
                heartbeat::HeartbeatEvent::PeerUnresponsive => {
                    tracing::error!("peer unresponsive after repeated missed pongs");
                }
            }
        }
    });

    let cleanup_bridge = Arc::clone(bridge);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let in_flight = cleanup_bridge.registry.len().await;
            tracing::debug!(in_flight, "periodic registry check");
        }
    });
}

fn build_router(bridge: SharedBridge) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(orchestrator::chat_completions))
        .route("/v1/models", get(admin::list_models))
        .route("/v1/refresh-models", post(admin::refresh_models))
        .route("/v1/admin/activate-id-capture", post(admin::activate_id_capture))
        .route("/healthz", get(admin::healthz))
        .route("/metrics", get(admin::metrics))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(bridge)
}
