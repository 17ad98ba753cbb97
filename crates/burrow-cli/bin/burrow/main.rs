mod cli;
mod commands;
mod config;

use crate::cli::{LogFormat, CLI};
use crate::config::Settings;
use anyhow::Context;
use burrow_generator::TimestampGenerator;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CLI::parse();
    init_tracing(cli.log_format);

    let settings = Settings::resolve(&cli)?;
    info!(
        backend = %settings.storage.backend(),
        base_url = %settings.base_url,
        user = %settings.user,
        "starting burrow"
    );

    let shutdown = CancellationToken::new();
    let repo = burrow_storage::open(
        &settings.storage,
        Arc::new(TimestampGenerator::default()),
        &shutdown,
    )
    .await
    .context("failed to open storage")?;

    let result = commands::run(cli.command, repo.as_ref(), &settings).await;
    repo.close().await;
    result
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
