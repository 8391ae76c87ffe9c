use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jobwatch_storage::HistoryStore;
use jobwatch_sync::{WatchConfig, WatchPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Watches a careers page and mails newly opened postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One collection + reconciliation run.
    Run,
    /// Scheduled runs per the configured cron expression.
    Watch,
    /// Prints active/closed counts from the persisted history.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = WatchPipeline::new(config)?;
            let summary = pipeline.run_once().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
        }
        Commands::Watch => {
            let mut config = config;
            config.scheduler_enabled = true;
            let cron = config.watch_cron.clone();
            let pipeline = Arc::new(WatchPipeline::new(config)?);
            let scheduler = pipeline
                .maybe_build_scheduler()
                .await?
                .expect("scheduler enabled for watch mode");
            scheduler.start().await.context("starting scheduler")?;
            info!(cron, "watching; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
        Commands::Status => {
            let store = HistoryStore::new(config.history_path.clone());
            let history = store.load(Utc::now().date_naive()).await?;
            let active = history.values().filter(|e| e.is_active()).count();
            println!(
                "history {}: {} postings ({} active, {} closed)",
                config.history_path.display(),
                history.len(),
                active,
                history.len() - active
            );
        }
    }

    Ok(())
}
