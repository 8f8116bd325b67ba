//! Corekeeper daemon
//!
//! Reconciles whatever a previous run left behind, starts the current
//! version and then health-checks it on a fixed interval until shut down.
//! Repeated failures trigger the orchestrator's automatic rollback.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use corekeeper_core::metrics::METRICS;
use corekeeper_core::telemetry::{init_tracing, LogFormat};
use corekeeper_core::{CoreConfig, ErrorKind, HealthStatus, Orchestrator};

#[derive(Parser)]
#[command(name = "corekeeperd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Supervise the local core process", long_about = None)]
struct Args {
    /// Core root directory
    #[arg(long, env = "COREKEEPER_HOME")]
    root: Option<PathBuf>,

    /// Seconds between health checks
    #[arg(long, env = "COREKEEPER_HEALTH_INTERVAL_SECS", default_value_t = 30)]
    interval_secs: u64,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(LogFormat::from_json_flag(args.json), level);

    let mut config = CoreConfig::from_env();
    if let Some(root) = &args.root {
        config = config.with_root(root);
    }
    let orch = Orchestrator::from_config(config).context("Failed to open core root")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    info!(
        root = %orch.config().root.display(),
        interval_secs = args.interval_secs,
        "corekeeperd started"
    );
    supervise(&orch, Duration::from_secs(args.interval_secs.max(1)), shutdown).await?;
    info!("corekeeperd stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn forward_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}

/// Recover, start, then check health every `interval` until `shutdown`
/// fires; the production process is stopped on the way out.
async fn supervise(orch: &Orchestrator, interval: Duration, shutdown: CancellationToken) -> Result<()> {
    let recovered = orch.recover().await.context("Recovery failed")?;
    info!(state = recovered.lifecycle.name(), "state reconciled");

    match orch.start(&shutdown).await {
        Ok(state) => info!(state = state.lifecycle.name(), "core started"),
        Err(e) if e.kind() == ErrorKind::InvalidState => {
            warn!(error = %e, "core not started; waiting for an upgrade")
        }
        Err(e) => error!(error = %e, "core failed to start"),
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match orch.check_health().await {
            Ok(HealthStatus::RolledBack(report)) => warn!(
                from = %report.from,
                to = report.to.as_deref().unwrap_or("none"),
                "automatic rollback performed"
            ),
            Ok(HealthStatus::Unhealthy { version, consecutive_failures }) => warn!(
                version = %version,
                consecutive_failures,
                "health check failed"
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "health check errored"),
        }
        METRICS.flush();
    }

    let stopped = orch.stop().await.context("Failed to stop core")?;
    info!(state = stopped.lifecycle.name(), "core stopped");
    Ok(())
}
