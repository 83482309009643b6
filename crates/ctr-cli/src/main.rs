use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ctr_core::ExternalKey;
use ctr_store::{DocumentFetcher, FetcherConfig, MemoryMappingStore, PgMappingStore};
use ctr_sync::{FrameworkRegistry, InMemoryTree, SyncConfig, SyncEngine};
use tracing::error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ctr-cli")]
#[command(about = "Competency taxonomy reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List upstream frameworks with their enabled state.
    Frameworks,
    /// Run one sync against in-memory stores and write the run report.
    DryRun,
    /// Keep running dry-run syncs on the configured cron schedule.
    Watch,
    /// Create the mapping table in the configured database.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Frameworks) {
        Commands::Frameworks => frameworks(&config).await,
        Commands::DryRun => {
            let engine = build_engine(config.clone())?;
            run_once(&engine, &config).await
        }
        Commands::Watch => watch(config).await,
        Commands::Migrate => migrate(&config).await,
    }
}

fn require_xml_url(config: &SyncConfig) -> Result<()> {
    if config.xml_url.is_empty() {
        bail!("CTR_XML_URL is not set");
    }
    Ok(())
}

fn active_filter(config: &SyncConfig) -> Result<HashSet<ExternalKey>> {
    if config.registry_path.exists() {
        Ok(FrameworkRegistry::load(&config.registry_path)?.active_filter())
    } else {
        Ok(HashSet::new())
    }
}

fn build_engine(config: SyncConfig) -> Result<SyncEngine> {
    let mappings = Arc::new(MemoryMappingStore::new());
    let tree = Arc::new(InMemoryTree::new());
    SyncEngine::new(config, mappings, tree)
}

async fn frameworks(config: &SyncConfig) -> Result<()> {
    require_xml_url(config)?;
    let active = active_filter(config)?;
    let fetcher = DocumentFetcher::new(FetcherConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        verify_tls: config.verify_tls,
        ..Default::default()
    })?;
    let text = fetcher
        .fetch_document(Uuid::new_v4(), &config.xml_url)
        .await?;
    let snapshot = ctr_extract::extract_snapshot(&text)?;

    for record in &snapshot.frameworks {
        let state = if active.contains(&record.key) {
            "enabled"
        } else {
            "disabled"
        };
        println!("{state:<9} {:<16} {}", record.key.to_string(), record.display_name);
    }
    Ok(())
}

async fn run_once(engine: &SyncEngine, config: &SyncConfig) -> Result<()> {
    require_xml_url(config)?;
    let report = engine.run(&active_filter(config)?).await?;
    println!(
        "sync complete: run_id={} frameworks={} created={} updated={} unchanged={} retired={} errors={}",
        report.run_id,
        report.enabled_frameworks,
        report.created,
        report.updated,
        report.unchanged,
        report.retired,
        report.errors.len()
    );
    Ok(())
}

async fn watch(config: SyncConfig) -> Result<()> {
    require_xml_url(&config)?;
    let cfg = config.clone();
    let engine = build_engine(config)?;
    let Some((sched, mut ticks)) = engine.maybe_build_scheduler().await? else {
        bail!("CTR_SCHEDULER_ENABLED is off; nothing to watch");
    };
    sched.start().await.context("starting scheduler")?;
    println!("watching upstream on cron `{}`; ctrl-c to stop", cfg.sync_cron);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            tick = ticks.recv() => {
                if tick.is_none() {
                    break;
                }
                if let Err(err) = run_once(&engine, &cfg).await {
                    error!("scheduled sync failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}

async fn migrate(config: &SyncConfig) -> Result<()> {
    let store = PgMappingStore::connect(&config.database_url).await?;
    store.migrate().await?;
    println!("mapping table ready");
    Ok(())
}
