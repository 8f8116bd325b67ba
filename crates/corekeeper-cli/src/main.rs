//! Corekeeper CLI
//!
//! Command-line interface for managing the locally supervised core binary.
//!
//! Commands:
//! - list: Show installed versions
//! - current: Show the version `current` points at
//! - use: Point `current` at an installed version
//! - remove: Delete an installed version
//! - prune: Delete old versions beyond the retention count
//! - state: Show (or reset) the persisted lifecycle document
//! - arch: Show the detected host platform
//! - releases: List published releases
//! - install: Download and install a release without activating it
//! - upgrade: Install, canary, promote (or roll back) a release
//! - rollback: Revert to the previous good version
//! - start / stop: Control the production process
//! - health: Run one health check
//! - recover: Reconcile state after a crash
//! - lock: Check whether a lifecycle lock is free

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Level};

use corekeeper_core::telemetry::{init_tracing, LogFormat};
use corekeeper_core::{
    CoreConfig, HealthStatus, InstalledVersion, LockName, Orchestrator, PersistedCoreState,
    UpgradeOutcome,
};

/// Corekeeper - install, canary, promote and roll back the core binary
#[derive(Parser)]
#[command(name = "corekeeper")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Blue/green lifecycle controller for the local core binary", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs and results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Core root directory
    #[arg(long, global = true, env = "COREKEEPER_HOME")]
    root: Option<PathBuf>,

    /// Repository publishing releases (owner/name)
    #[arg(long, global = true, env = "COREKEEPER_RELEASE_REPO")]
    repo: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show installed versions, newest first
    List,

    /// Show the version `current` points at
    Current,

    /// Point `current` at an installed version
    Use {
        /// Installed version to activate
        version: String,
    },

    /// Delete an installed version (never the current one)
    Remove {
        /// Version to delete
        version: String,
    },

    /// Delete versions beyond the newest N
    Prune {
        /// Versions to keep (defaults to the configured retention)
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// Show the persisted lifecycle state
    State {
        /// Clear an error state back to idle
        #[arg(long)]
        reset: bool,
    },

    /// Show the detected host platform
    Arch,

    /// List published releases
    Releases,

    /// Download and install a release without activating it
    Install {
        /// Release tag (defaults to the newest stable release)
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Install, canary and promote a release
    Upgrade {
        /// Release tag (defaults to the newest stable release)
        #[arg(short, long)]
        tag: Option<String>,

        /// Wait for a concurrent upgrade instead of failing
        #[arg(long)]
        wait: bool,
    },

    /// Revert to the last known good version
    Rollback,

    /// Launch the current version on the production port
    Start,

    /// Stop the production process
    Stop,

    /// Run one health check against the production process
    Health,

    /// Reconcile a state left behind by a crash
    Recover,

    /// Check whether a lifecycle lock is currently free
    Lock {
        /// Lock to probe (install or upgrade)
        name: LockName,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(LogFormat::from_json_flag(cli.json), level);

    let orch = Orchestrator::from_config(config_for(&cli))
        .context("Failed to open core root")?;
    let json = cli.json;

    match cli.command {
        Commands::List => cmd_list(&orch, json),
        Commands::Current => cmd_current(&orch, json),
        Commands::Use { version } => cmd_use(&orch, &version, json),
        Commands::Remove { version } => cmd_remove(&orch, &version, json),
        Commands::Prune { keep } => cmd_prune(&orch, keep, json),
        Commands::State { reset } => cmd_state(&orch, reset, json).await,
        Commands::Arch => cmd_arch(&orch, json),
        Commands::Releases => cmd_releases(&orch, json).await,
        Commands::Install { tag } => cmd_install(&orch, tag.as_deref(), json).await,
        Commands::Upgrade { tag, wait } => cmd_upgrade(&orch, tag.as_deref(), wait, json).await,
        Commands::Rollback => cmd_rollback(&orch, json).await,
        Commands::Start => cmd_start(&orch, json).await,
        Commands::Stop => cmd_stop(&orch, json).await,
        Commands::Health => cmd_health(&orch, json).await,
        Commands::Recover => cmd_recover(&orch, json).await,
        Commands::Lock { name } => cmd_lock(&orch, name, json),
    }
}

fn config_for(cli: &Cli) -> CoreConfig {
    let mut config = CoreConfig::from_env();
    if let Some(root) = &cli.root {
        config = config.with_root(root);
    }
    if let Some(repo) = &cli.repo {
        config = config.with_release_repo(repo);
    }
    config
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Token cancelled on the first Ctrl-C, for long-running operations.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}

fn print_state(state: &PersistedCoreState, json: bool) -> Result<()> {
    if json {
        return print_json(state);
    }
    println!("State:            {}", state.lifecycle);
    println!(
        "Active:           {}",
        state.active_version.as_deref().unwrap_or("none")
    );
    println!(
        "Last known good:  {}",
        state.last_known_good_version.as_deref().unwrap_or("none")
    );
    println!("Health failures:  {}", state.consecutive_health_failures);
    if let Some(attempt) = &state.last_upgrade_attempt {
        let result = attempt.result.as_deref().unwrap_or("in progress");
        match &attempt.error_code {
            Some(code) => println!("Last upgrade:     {} {} ({})", attempt.version, result, code),
            None => println!("Last upgrade:     {} {}", attempt.version, result),
        }
    }
    Ok(())
}

fn print_installed(version: &InstalledVersion) {
    let marker = if version.is_current { "*" } else { " " };
    println!(
        "{} {:<20} {}  {}",
        marker,
        version.version,
        version.installed_at.to_rfc3339(),
        version.arch.as_deref().unwrap_or("-")
    );
}

fn cmd_list(orch: &Orchestrator, json: bool) -> Result<()> {
    let installed = orch.versions().list_installed()?;
    if json {
        return print_json(&installed);
    }
    if installed.is_empty() {
        println!("No versions installed");
        return Ok(());
    }
    for version in &installed {
        print_installed(version);
    }
    Ok(())
}

fn cmd_current(orch: &Orchestrator, json: bool) -> Result<()> {
    let current = orch.versions().current_version();
    if json {
        return print_json(&serde_json::json!({ "current": current }));
    }
    match current {
        Some(version) => println!("{}", version),
        None => println!("No current version"),
    }
    Ok(())
}

fn cmd_use(orch: &Orchestrator, version: &str, json: bool) -> Result<()> {
    let _guard = orch
        .locks()
        .try_acquire(LockName::Upgrade)?
        .context("An upgrade is in progress; try again later")?;
    orch.versions().set_current(version)?;
    if json {
        return print_json(&serde_json::json!({ "current": version }));
    }
    println!("current -> {}", version);
    Ok(())
}

fn cmd_remove(orch: &Orchestrator, version: &str, json: bool) -> Result<()> {
    let _guard = orch
        .locks()
        .try_acquire(LockName::Upgrade)?
        .context("An upgrade is in progress; try again later")?;
    orch.versions().remove(version)?;
    if json {
        return print_json(&serde_json::json!({ "removed": version }));
    }
    println!("Removed {}", version);
    Ok(())
}

fn cmd_prune(orch: &Orchestrator, keep: Option<usize>, json: bool) -> Result<()> {
    let report = orch.prune(keep)?;
    if json {
        return print_json(&report);
    }
    for version in &report.removed {
        println!("Removed {}", version);
    }
    for version in &report.failed {
        println!("Could not remove {}", version);
    }
    println!(
        "Kept {} version(s), removed {}",
        report.kept.len(),
        report.removed.len()
    );
    Ok(())
}

async fn cmd_state(orch: &Orchestrator, reset: bool, json: bool) -> Result<()> {
    let state = if reset {
        orch.reset_error().await?
    } else {
        orch.state().await?
    };
    print_state(&state, json)
}

fn cmd_arch(orch: &Orchestrator, json: bool) -> Result<()> {
    let platform = orch.platform();
    if json {
        return print_json(platform);
    }
    println!("OS:           {}", platform.os.as_str());
    println!("Arch:         {}", platform.arch.as_str());
    println!("Translated:   {}", platform.translated);
    println!("Can run x64:  {}", platform.translation_available);
    Ok(())
}

async fn cmd_releases(orch: &Orchestrator, json: bool) -> Result<()> {
    let releases = orch.releases().await?;
    if json {
        return print_json(&releases);
    }
    if releases.is_empty() {
        println!("No releases published");
        return Ok(());
    }
    for release in &releases {
        let published = release
            .published_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let installed = orch.versions().installed(&release.version_string())?.is_some();
        println!(
            "{:<20} {}  {} asset(s){}{}",
            release.tag_name,
            published,
            release.assets.len(),
            if release.prerelease { "  prerelease" } else { "" },
            if installed { "  installed" } else { "" }
        );
    }
    Ok(())
}

async fn cmd_install(orch: &Orchestrator, tag: Option<&str>, json: bool) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let outcome = orch.install(tag, &cancel).await?;
    if json {
        return print_json(&outcome);
    }
    if outcome.fresh {
        println!("Installed {}", outcome.installed.version);
    } else {
        println!("{} is already installed", outcome.installed.version);
    }
    Ok(())
}

async fn cmd_upgrade(orch: &Orchestrator, tag: Option<&str>, wait: bool, json: bool) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let outcome = orch.upgrade(tag, wait, &cancel).await?;
    if json {
        return print_json(&outcome);
    }
    match &outcome {
        UpgradeOutcome::UpToDate { version } => println!("Already running {}", version),
        UpgradeOutcome::Promoted { version, previous } => match previous {
            Some(previous) => println!("Promoted {} (was {})", version, previous),
            None => println!("Promoted {}", version),
        },
        UpgradeOutcome::RolledBack(report) => {
            println!(
                "Upgrade to {} failed; rolled back to {}",
                report.from,
                report.to.as_deref().unwrap_or("nothing")
            );
            if let Some(reason) = &report.reason {
                println!("  reason: [{}] {}", reason.kind.as_str(), reason.message);
            }
        }
    }
    Ok(())
}

async fn cmd_rollback(orch: &Orchestrator, json: bool) -> Result<()> {
    let report = orch.rollback().await?;
    if json {
        return print_json(&report);
    }
    println!(
        "Rolled back {} -> {}",
        report.from,
        report.to.as_deref().unwrap_or("nothing")
    );
    Ok(())
}

async fn cmd_start(orch: &Orchestrator, json: bool) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let state = orch.start(&cancel).await?;
    print_state(&state, json)
}

async fn cmd_stop(orch: &Orchestrator, json: bool) -> Result<()> {
    let state = orch.stop().await?;
    print_state(&state, json)
}

async fn cmd_health(orch: &Orchestrator, json: bool) -> Result<()> {
    let status = orch.check_health().await?;
    if json {
        print_json(&status)?;
    } else {
        match &status {
            HealthStatus::NotRunning => println!("Core is not running"),
            HealthStatus::Healthy { version } => println!("{} is healthy", version),
            HealthStatus::Unhealthy {
                version,
                consecutive_failures,
            } => println!(
                "{} is unhealthy ({} consecutive failure(s))",
                version, consecutive_failures
            ),
            HealthStatus::Superseded { version } => {
                println!("{} was replaced during the check; result discarded", version)
            }
            HealthStatus::RolledBack(report) => println!(
                "{} failed repeatedly; rolled back to {}",
                report.from,
                report.to.as_deref().unwrap_or("nothing")
            ),
        }
    }
    if matches!(
        status,
        HealthStatus::Unhealthy { .. } | HealthStatus::RolledBack(_)
    ) {
        anyhow::bail!("Health check failed");
    }
    Ok(())
}

async fn cmd_recover(orch: &Orchestrator, json: bool) -> Result<()> {
    let state = orch.recover().await?;
    print_state(&state, json)
}

fn cmd_lock(orch: &Orchestrator, name: LockName, json: bool) -> Result<()> {
    let free = orch.locks().try_acquire(name)?.is_some();
    let path = orch.locks().lock_path(name);
    if json {
        return print_json(&serde_json::json!({
            "lock": name.as_str(),
            "path": path,
            "free": free,
        }));
    }
    if free {
        println!("{} lock is free ({})", name, path.display());
    } else {
        println!("{} lock is held ({})", name, path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use corekeeper_core::fakes::{
        LocalAssetFetcher, RecordingLauncher, ScriptedHealthProbe, StaticReleaseFeed,
    };
    use corekeeper_core::{Components, HostArch, HostPlatform, OsToken, ReleaseFeed};
    use std::sync::Arc;

    fn offline(root: &std::path::Path) -> Orchestrator {
        Orchestrator::with_components(
            CoreConfig::default().with_root(root.join("core")),
            Components {
                feed: Some(Arc::new(StaticReleaseFeed::new(vec![])) as Arc<dyn ReleaseFeed>),
                fetcher: Arc::new(LocalAssetFetcher::new(root.join("assets"))),
                launcher: Arc::new(RecordingLauncher::new()),
                probe: Arc::new(ScriptedHealthProbe::healthy()),
                platform: HostPlatform::new(OsToken::Linux, HostArch::X86_64),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_upgrade_flags() {
        let cli = Cli::try_parse_from(["corekeeper", "--json", "upgrade", "--tag", "v1.2.0", "--wait"])
            .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Upgrade { tag, wait } => {
                assert_eq!(tag.as_deref(), Some("v1.2.0"));
                assert!(wait);
            }
            _ => panic!("expected upgrade"),
        }
    }

    #[test]
    fn test_parse_lock_name() {
        let cli = Cli::try_parse_from(["corekeeper", "lock", "install"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Lock {
                name: LockName::Install
            }
        ));
        assert!(Cli::try_parse_from(["corekeeper", "lock", "everything"]).is_err());
    }

    #[test]
    fn test_root_flag_overrides_config() {
        let cli = Cli::try_parse_from(["corekeeper", "--root", "/srv/core", "list"]).unwrap();
        assert_eq!(config_for(&cli).root, PathBuf::from("/srv/core"));
    }

    #[tokio::test]
    async fn test_use_rejects_missing_version() {
        let dir = tempfile::tempdir().unwrap();
        let orch = offline(dir.path());
        let err = cmd_use(&orch, "9.9.9", false).unwrap_err();
        assert!(format!("{err:#}").contains("9.9.9"));
        assert!(orch.versions().current_version().is_none());
    }

    #[tokio::test]
    async fn test_use_refuses_while_upgrade_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        let orch = offline(dir.path());
        let _held = orch.locks().try_acquire(LockName::Upgrade).unwrap().unwrap();
        let err = cmd_use(&orch, "1.0.0", false).unwrap_err();
        assert!(format!("{err:#}").contains("upgrade is in progress"));
    }

    #[tokio::test]
    async fn test_lock_probe_does_not_keep_lock() {
        let dir = tempfile::tempdir().unwrap();
        let orch = offline(dir.path());
        cmd_lock(&orch, LockName::Install, true).unwrap();
        assert!(orch.locks().try_acquire(LockName::Install).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_health_when_not_running_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let orch = offline(dir.path());
        cmd_health(&orch, false).await.unwrap();
    }
}
