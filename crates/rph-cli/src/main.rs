use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rph_sync::{run_crawl, run_reconcile, CrawlConfig, ReconcileJob, SourceRegistry};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rph-cli")]
#[command(about = "Real-estate project harvester: crawl listing sites and reconcile projects")]
struct Cli {
    /// Source registry (YAML).
    #[arg(long, global = true, env = "RPH_SOURCES", default_value = "./sources.yaml")]
    sources: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source into the sink, resuming where the last run stopped.
    Crawl {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        progress: Option<PathBuf>,
        /// Refetch items whose previous attempt ended in an error record.
        #[arg(long)]
        retry_failed: bool,
        /// Ignore the seen set.
        #[arg(long)]
        force: bool,
    },
    /// Link crawled records across sources and write per-unit statistics.
    Reconcile {
        /// Record files (NDJSON) to read.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long, default_value = "./data/reconciled.ndjson")]
        output: PathBuf,
        #[arg(long, default_value = "./data/unmatched.ndjson")]
        unmatched: PathBuf,
        #[arg(long)]
        truth_source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rph_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let registry = SourceRegistry::load(&cli.sources)
        .await
        .with_context(|| format!("loading source registry {}", cli.sources.display()))?;
    info!(
        sources = %cli.sources.display(),
        enabled = registry.enabled().count(),
        "loaded source registry"
    );

    match cli.command {
        Commands::Crawl {
            workers,
            output,
            progress,
            retry_failed,
            force,
        } => {
            let mut config = CrawlConfig::from_env()?;
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(output) = output {
                config.output_path = output;
            }
            if let Some(progress) = progress {
                config.progress_path = progress;
            }
            config.retry_failed |= retry_failed;
            config.force |= force;
            config.validate()?;
            info!(
                workers = config.workers,
                output = %config.output_path.display(),
                "starting crawl"
            );

            let summary = run_crawl(config, registry).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Reconcile {
            inputs,
            output,
            unmatched,
            truth_source,
        } => {
            let job = ReconcileJob {
                inputs,
                output_path: output,
                unmatched_path: unmatched,
                truth_source,
            };
            let summary = run_reconcile(&job, &registry).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
