//! # PostPilot — operator task scheduler daemon
//!
//! Loads the registry snapshot, rebuilds agent handles, starts the dispatch
//! loop, and runs until interrupted. The control plane is wired up here and
//! handed to whatever transport façade the deployment mounts on top.
//!
//! Usage:
//!   postpilot                        # run with ~/.postpilot/config.toml
//!   postpilot --data-dir /srv/pp     # override the data directory
//!   postpilot --no-dispatch          # load state but do not schedule

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use postpilot_agent::McpAgentFactory;
use postpilot_core::AppConfig;
use postpilot_scheduler::{
    ControlPlane, Dispatcher, ExecutionLock, LicenseGate, Registry, SnapshotStore, SystemClock,
    TaskStatus,
};

#[derive(Parser)]
#[command(
    name = "postpilot",
    version,
    about = "🪶 PostPilot — scheduler for social-account operator jobs"
)]
struct Cli {
    /// Config file (default: ~/.postpilot/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the data directory from the config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Load state but do not start the dispatch loop
    #[arg(long)]
    no_dispatch: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "postpilot=debug,postpilot_scheduler=debug,postpilot_agent=debug"
    } else {
        "postpilot=info,postpilot_scheduler=info,postpilot_agent=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    std::fs::create_dir_all(&config.data_dir)?;
    tracing::info!("data directory: {}", config.data_dir.display());

    let clock = Arc::new(SystemClock);
    let factory = Arc::new(McpAgentFactory::new(
        &config.automation.service_url,
        Duration::from_secs(config.automation.probe_timeout_secs),
    ));

    let registry = Arc::new(Registry::new(
        clock.clone(),
        factory,
        SnapshotStore::new(config.snapshot_path()),
        config.tasks_dir(),
    ));
    registry.restore();

    let exec_lock = Arc::new(ExecutionLock::new());
    let dispatcher = Dispatcher::new(
        registry.clone(),
        exec_lock.clone(),
        clock.clone(),
        config.shared_cookie_path(),
        Duration::from_secs(config.dispatcher.idle_poll_secs),
        Duration::from_secs(config.dispatcher.shutdown_grace_secs),
    );

    let gate = LicenseGate::load(&config.license_path(), clock.clone());
    if !gate.is_activated() {
        tracing::info!("running in free-trial mode (1 task, fixed interval)");
    } else if gate.is_expired() {
        tracing::warn!("license is expired, free-trial limits apply");
    }

    let control = ControlPlane::new(
        registry,
        dispatcher,
        exec_lock,
        gate,
        clock,
        Duration::from_secs(config.dispatcher.execute_now_wait_secs),
    );

    if cli.no_dispatch {
        tracing::info!("--no-dispatch: loop not started");
    } else {
        let status = control.start_dispatcher();
        let pending = status.counts.get(&TaskStatus::Pending).copied().unwrap_or(0);
        tracing::info!("dispatching with {pending} pending task(s)");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    control.stop_dispatcher().await;
    Ok(())
}
