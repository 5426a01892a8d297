use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crmd_sync::{EntityRegistry, SyncConfig, SyncPipeline};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "crmd-cli")]
#[command(about = "Legacy CRM delta detection and staging loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect and stage every enabled entity once
    Sync,
    /// Detect changes for one entity without persisting state or staging rows
    Detect {
        #[arg(long)]
        entity: String,
        /// Extract to diff instead of the configured one
        #[arg(long)]
        snapshot: Option<String>,
    },
    /// Print the persisted load state per entity
    Status,
    /// Validate entities.yaml
    Validate,
    /// Match legacy records against a HubSpot export
    Reconcile {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        hubspot: String,
    },
    /// Run the cron scheduler until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config)?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} entities={} failed={} reports={}",
                summary.run_id,
                summary.entities.len(),
                summary.failed,
                summary.reports_dir
            );
            if summary.failed > 0 {
                anyhow::bail!("{} entity run(s) failed", summary.failed);
            }
        }
        Commands::Detect { entity, snapshot } => {
            let pipeline = SyncPipeline::from_config(config)?;
            let delta = pipeline.preview(&entity, snapshot.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&delta.summary())?);
        }
        Commands::Status => {
            let pipeline = SyncPipeline::from_config(config)?;
            let statuses = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Commands::Validate => {
            let path = config.registry_path();
            let registry = EntityRegistry::load(&path)?;
            registry
                .validate()
                .with_context(|| format!("validating {}", path.display()))?;
            println!(
                "{}: {} entities ({} enabled) valid",
                path.display(),
                registry.entities.len(),
                registry.enabled().count()
            );
        }
        Commands::Reconcile { entity, hubspot } => {
            let pipeline = SyncPipeline::from_config(config)?;
            let report = pipeline.reconcile(&entity, &hubspot).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(config)?);
            let Some(mut sched) = pipeline.clone().maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set CRMD_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
