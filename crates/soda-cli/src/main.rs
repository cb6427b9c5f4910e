use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soda_core::parse_floating_timestamp;
use soda_sync::{build_scheduler, IngestConfig, IngestPipeline};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "soda-cli")]
#[command(about = "Incremental Socrata open-data ingest into a Parquet snapshot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingest pass and exit.
    Run,
    /// Run ingest passes on the INGEST_CRON schedule until interrupted.
    Schedule,
    /// Print the stored watermark and snapshot summary as JSON.
    Status,
    /// Write the starting watermark for a fresh bucket.
    Init {
        /// Floating timestamp such as 2024-01-01T00:00:00.
        #[arg(long)]
        last_date: String,
        /// Overwrite an existing watermark.
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing("info");
    let cli = Cli::parse();

    let config = IngestConfig::from_env().context("loading ingest configuration")?;
    tracing::info!(
        project = %config.project_name,
        bucket = %config.bucket_name,
        dataset = %config.dataset,
        "configuration loaded"
    );
    let pipeline = IngestPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let outcome = pipeline.run_once().await?;
            println!("{}", outcome.status_line());
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let cron = pipeline.config().ingest_cron.clone();
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!(%cron, "scheduler started; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
            tracing::info!("scheduler stopped");
        }
        Commands::Status => {
            let report = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Init { last_date, force } => {
            let last_date = parse_floating_timestamp(&last_date)
                .with_context(|| format!("parsing --last-date {last_date}"))?;
            let watermark = pipeline.bootstrap(last_date, force).await?;
            println!("{}", serde_json::to_string(&watermark)?);
        }
    }

    Ok(())
}
