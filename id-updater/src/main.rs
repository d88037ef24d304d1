//! One-shot helper: flips the running bridge into id-capture mode, waits
//! for the companion user-script to report a freshly-opened conversation's
//! `sessionId`/`messageId`, and writes them into the named model's
//! `model_endpoint_map` entry (spec §4.J, §9 design note).

use anyhow::{Context, Result};
use bridge_core::config::set_endpoint_key;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "id_updater")]
#[command(about = "Capture a fresh session/message id pair for one model and write it into the bridge config")]
struct Cli {
    /// The model key inside model_endpoint_map to update
    #[arg(long)]
    model: String,

    /// Base URL of the running bridge
    #[arg(long, default_value = "http://127.0.0.1:9080")]
    bridge_url: String,

    /// Local port the companion user-script's helper POSTs the captured ids to
    #[arg(long, default_value_t = 8765)]
    listen_port: u16,

    #[arg(long, env = "BRIDGE_CONFIG_PATH", default_value = "config.jsonc")]
    config_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CapturedIds {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "messageId")]
    message_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let client = reqwest::Client::new();
    client
        .post(format!("{}/v1/admin/activate-id-capture", cli.bridge_url))
        .send()
        .await
        .context("failed to activate id capture on the bridge")?;
    tracing::info!(model = %cli.model, port = cli.listen_port, "id capture activated, waiting for the companion script");

    let ids = wait_for_capture(cli.listen_port).await?;
    tracing::info!(session_id = %ids.session_id, message_id = %ids.message_id, "captured a fresh session");

    let raw = tokio::fs::read_to_string(&cli.config_path)
        .await
        .with_context(|| format!("failed to read {}", cli.config_path.display()))?;
    let rewritten = set_endpoint_key(&raw, &cli.model, "session_id", &ids.session_id)
        .and_then(|r| set_endpoint_key(&r, &cli.model, "message_id", &ids.message_id))
        .map_err(anyhow::Error::msg)?;
    tokio::fs::write(&cli.config_path, rewritten)
        .await
        .with_context(|| format!("failed to write {}", cli.config_path.display()))?;

    println!("updated '{}' in {}", cli.model, cli.config_path.display());
    Ok(())
}

/// Accept exactly one connection and parse a minimal HTTP/1.1 request
/// carrying a `{sessionId, messageId}` JSON body. No routing, no keep-alive:
/// the companion script only ever sends one POST per capture.
async fn wait_for_capture(port: u16) -> Result<CapturedIds> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind capture listener on 127.0.0.1:{port}"))?;
    let (mut stream, _) = listener.accept().await.context("failed to accept capture connection")?;

    let mut content_length = 0usize;
    {
        let mut reader = BufReader::new(&mut stream);
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            if line.is_empty() || line == "\r\n" || line == "\n" {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;

        let ids: CapturedIds =
            serde_json::from_slice(&body).context("capture payload was not {sessionId, messageId}")?;

        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
            .await?;
        return Ok(ids);
    }
}
