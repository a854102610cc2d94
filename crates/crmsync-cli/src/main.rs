use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crmsync_pipeline::{
    maybe_build_scheduler, run_all, InstanceRegistry, SyncConfig, SyncPipeline,
};
use crmsync_storage::{DealStore, PgDealStore};
use crmsync_web::AppState;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crmsync")]
#[command(about = "Synchronize CRM deals into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full sync of every enabled source instance.
    Sync,
    /// Sync a single deal by its external ID.
    SyncOne {
        id: String,
        /// Instance to sync against; defaults to the first enabled one.
        #[arg(long)]
        instance: Option<String>,
    },
    /// Serve the webhook endpoint (and the cron scheduler, if enabled).
    Serve {
        /// Instance the webhook syncs against; defaults to the first
        /// enabled one.
        #[arg(long)]
        instance: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let registry = InstanceRegistry::load(&config.registry_path)?;
    let store = connect_store(&config).await?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summaries = run_all(&config, &registry, store).await?;
            for summary in &summaries {
                println!(
                    "sync complete: instance={} run_id={} pages={} records={} skipped={}",
                    summary.instance_id,
                    summary.run_id,
                    summary.pages,
                    summary.records_processed,
                    summary.records_skipped
                );
            }
            if summaries.is_empty() {
                bail!("no sync run completed");
            }
        }
        Commands::SyncOne { id, instance } => {
            let pipeline = pipeline_for(&config, &registry, instance.as_deref(), store)?;
            let synced = pipeline.sync_one(&id).await?;
            println!("synced deal {synced} on instance {}", pipeline.instance_id());
        }
        Commands::Serve { instance } => {
            let scheduler = maybe_build_scheduler(
                Arc::new(config.clone()),
                Arc::new(registry.clone()),
                store.clone(),
            )
            .await?;
            if let Some(mut scheduler) = scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!("cron scheduler started");
            }

            let pipeline = pipeline_for(&config, &registry, instance.as_deref(), store)?;
            let port = std::env::var("CRMSYNC_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1321);
            crmsync_web::serve(AppState::new(Arc::new(pipeline)), port).await?;
        }
    }

    Ok(())
}

async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn DealStore>> {
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(PgDealStore::new(pool)))
}

fn pipeline_for(
    config: &SyncConfig,
    registry: &InstanceRegistry,
    instance_id: Option<&str>,
    store: Arc<dyn DealStore>,
) -> Result<SyncPipeline> {
    let instance = match instance_id {
        Some(id) => registry
            .find(id)
            .with_context(|| format!("instance {id} not found in registry"))?,
        None => registry
            .enabled()
            .next()
            .context("no enabled instance in registry")?,
    };
    SyncPipeline::for_instance(config, instance, store)
}
