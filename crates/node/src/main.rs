//! chainwatch - passive observer daemon for the public gossip network.
//!
//! The daemon maintains one long-lived outbound connection per target
//! region, records first-seen transaction and block observations with
//! per-peer propagation timing into the relational store, and exposes
//! Prometheus metrics on `/metrics`.
//!
//! Usage:
//!   chainwatch [--config config.json]
//!
//! Runs until SIGINT/SIGTERM; exits non-zero on configuration or
//! database failures.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chainwatch_monitoring as monitoring;
use chainwatch_observer::{
    spawn_refresh_loop, spawn_slot_maintenance, spawn_status_reporter, spawn_sweeper, Discovery,
    PeerPool, PoolPolicy, SeenCaches, SessionHandles,
};
use chainwatch_storage::{ObserverStore, PostgresStore};

use crate::config::Config;

/// Cap on waiting for sessions to wind down after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "chainwatch",
    about = "Passive observer of the public gossip P2P network",
    version
)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, short = 'c', default_value = "config.json", value_name = "PATH")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("chainwatch observer starting");
    info!("network: mainnet, regional peer selection enabled");

    let cfg = Config::load(&cli.config)?;

    let store = PostgresStore::connect(
        &cfg.db_host,
        cfg.db_port,
        &cfg.db_user,
        &cfg.db_password,
        &cfg.db_name,
    )
    .await
    .context("failed to connect to database")?;
    store
        .ensure_schema()
        .await
        .context("failed to ensure database schema")?;
    info!(host = %cfg.db_host, db = %cfg.db_name, "connected to database");
    let store: Arc<dyn ObserverStore> = Arc::new(store);

    // Seed counters from historical totals so restarts don't zero the
    // exported series.
    match store.totals().await {
        Ok(totals) => monitoring::seed_from_totals(&totals),
        Err(err) => warn!(error = %err, "failed to seed metrics from store"),
    }

    let token = CancellationToken::new();
    tokio::spawn(monitoring::serve(cfg.metrics_port, token.clone()));

    let pool = Arc::new(PeerPool::new(PoolPolicy {
        peers_per_region: cfg.observer.peers_per_country,
        ..PoolPolicy::default()
    }));
    let seen = Arc::new(SeenCaches::new());
    let handles = SessionHandles {
        pool: Arc::clone(&pool),
        seen: Arc::clone(&seen),
        store: Arc::clone(&store),
        token: token.clone(),
    };

    spawn_sweeper(Arc::clone(&seen), token.clone());

    let discovery = Arc::new(Discovery::new(cfg.observer.clone()));
    // First discovery runs inline so the pool has candidates before the
    // slot loop starts.
    discovery.refresh(&pool).await;
    spawn_refresh_loop(Arc::clone(&discovery), Arc::clone(&pool), token.clone());

    let tracker = TaskTracker::new();
    spawn_slot_maintenance(
        handles.clone(),
        cfg.observer.target_countries.clone(),
        tracker.clone(),
    );
    spawn_status_reporter(Arc::clone(&pool), token.clone());

    wait_for_shutdown_signal().await;
    info!("signal received, initiating graceful shutdown");

    token.cancel();
    tracker.close();
    match tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await {
        Ok(()) => info!("all sessions closed gracefully"),
        Err(_) => warn!("shutdown timeout, forcing exit"),
    }

    if let Err(err) = store.close().await {
        error!(error = %err, "error closing store");
    } else {
        info!("store closed");
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
