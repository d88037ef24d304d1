//! Thin client that asks the running bridge to re-fetch its model
//! inventory from the peer (spec §4.J).

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(name = "model_updater")]
#[command(about = "Trigger a model registry refresh on the running bridge")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:9080")]
    bridge_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/refresh-models", cli.bridge_url))
        .send()
        .await
        .context("failed to reach the bridge")?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    println!("{status}: {body}");
    if !status.is_success() {
        bail!("refresh-models request failed");
    }
    Ok(())
}
