use std::env;
use std::fs::File;
use std::io;

use anyhow::{Context, Result};
use escrow_engine::{replay_commands, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    anyhow::ensure!(
        args.len() == 2,
        "Usage: {} <commands.csv>",
        args.first().map(String::as_str).unwrap_or("escrow-engine")
    );

    let filename = &args[1];

    let file = File::open(filename)
        .with_context(|| format!("Failed to open input file '{}'", filename))?;

    let mut config = Config::from_env().context("Invalid configuration")?;
    if !config.escrow.enabled {
        tracing::info!("escrow feature is off in the environment; enabling it for replay");
        config.escrow.enabled = true;
    }

    replay_commands(file, io::stdout(), config)
        .await
        .context("Failed to replay commands and write output")?;

    Ok(())
}
