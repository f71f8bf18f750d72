//! cmdbsyncd: the CMDB cache synchronizer daemon.
//!
//! Mirrors the CMDB into the configured key-value store:
//! - Change watchers (one per resource kind)
//! - Event orchestrator (scheduled full refreshes + incremental apply)
//! - Relation metrics pusher
//!
//! # Usage
//!
//! ```text
//! cmdbsyncd run --config /etc/cmdbsync/cmdbsync.toml
//! cmdbsyncd refresh --config cmdbsync.toml --cache-type host_topo
//! ```

mod services;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use cmdbsync_cache::{build_manager_named, refresh_all};
use cmdbsync_core::TaskConfig;
use cmdbsync_relation::RelationPusher;
use cmdbsync_watch::{ChangeWatcher, EventOrchestrator};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::services::{Services, watched_kinds};

const DEFAULT_LOG_FILTER: &str = "info,cmdbsync=debug";

#[derive(Parser)]
#[command(name = "cmdbsyncd", about = "CMDB cache synchronizer daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run watchers, the event orchestrator and the relation pusher.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run one full refresh and exit.
    Refresh {
        #[arg(long)]
        config: PathBuf,

        /// Cache types to refresh; all configured types when omitted.
        #[arg(long = "cache-type")]
        cache_types: Vec<String>,
    },
    /// Run only the change watchers.
    Watch {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => run(&config, false).await,
        Command::Watch { config } => run(&config, true).await,
        Command::Refresh {
            config,
            cache_types,
        } => refresh(&config, &cache_types).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

async fn run(config_path: &Path, watch_only: bool) -> anyhow::Result<()> {
    let config = TaskConfig::from_file(config_path)?;
    info!(config = %config_path.display(), watch_only, "cmdbsync daemon starting");

    let services = Services::build(config).await?;
    let config = &services.config;
    let cache_types = config.cache_types()?;
    let sink = services.metrics_sink()?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // ── Change watchers ────────────────────────────────────────

    let watcher = Arc::new(
        ChangeWatcher::new(
            services.namespace.clone(),
            services.store.clone(),
            services.registry.clone(),
        )
        .with_poll_idle(Duration::from_secs(config.watch.poll_idle_secs)),
    );
    let kinds = watched_kinds(&cache_types);
    info!(kinds = kinds.len(), "change watchers starting");
    handles.push(tokio::spawn(watcher.run_all(kinds, shutdown_rx.clone())));

    if !watch_only {
        // ── Relations from what is already cached ──────────────

        let managers = services.managers(&cache_types);
        for (cache_type, manager) in &managers {
            if let Err(e) = manager.build_relation_metrics().await {
                warn!(%cache_type, error = %e, "relation rebuild from cache failed");
            }
        }

        // ── Event orchestrator ─────────────────────────────────

        let orchestrator =
            EventOrchestrator::new(services.namespace.clone(), services.store.clone(), managers)
                .with_config(config);
        let interval = config.handle_interval();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.run(interval, shutdown).await;
        }));

        // ── Relation pusher ────────────────────────────────────

        let pusher = RelationPusher::new(services.relations.clone(), sink);
        let interval = Duration::from_secs(config.relation.push_interval_secs);
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            pusher.run(interval, shutdown).await;
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("installing ctrl-c handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "task ended abnormally");
        }
    }

    info!("cmdbsync daemon stopped");
    Ok(())
}

async fn refresh(config_path: &Path, names: &[String]) -> anyhow::Result<()> {
    let config = TaskConfig::from_file(config_path)?;
    let services = Services::build(config).await?;

    let names: Vec<String> = if names.is_empty() {
        services
            .config
            .cache_types()?
            .iter()
            .map(|t| t.as_str().to_string())
            .collect()
    } else {
        names.to_vec()
    };

    let ctx = services.context();
    let mut managers = names
        .iter()
        .map(|name| build_manager_named(name, ctx.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    // Declaration order puts host topology before service instances,
    // which enrich from the host cache.
    managers.sort_by_key(|m| m.cache_type());
    managers.dedup_by_key(|m| m.cache_type());

    let mut failed = Vec::new();
    for manager in &managers {
        let cache_type = manager.cache_type();
        if let Err(e) = refresh_all(manager.clone()).await {
            error!(%cache_type, error = %e, "full refresh failed");
            failed.push(cache_type.to_string());
        }
    }

    if !failed.is_empty() {
        bail!("full refresh failed for {}", failed.join(", "));
    }
    info!(cache_types = managers.len(), "full refresh finished");
    Ok(())
}
