//! The lifecycle orchestrator.
//!
//! Drives install, canary, promotion and rollback over the durable stores.
//! Every lifecycle transition is persisted to `state.json` before it is
//! broadcast, so a crash at any point leaves a state [`Orchestrator::recover`]
//! knows how to reconcile.
//!
//! Operations that touch the running process or the `current` link hold the
//! `upgrade` lock; installs additionally hold the `install` lock.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use corekeeper_store::{
    attempt_result, timestamp, CoreLayout, ErrorInfo, LifecycleState, LockGuard, LockManager,
    LockName, PersistedCoreState, PruneReport, StateStore, UpgradeAttempt, VersionStore,
};

use crate::arch::HostPlatform;
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::feed::{GithubReleaseFeed, ReleaseFeed};
use crate::fetch::{AssetFetcher, HttpAssetFetcher};
use crate::health::{await_healthy, HealthProbe, HttpHealthProbe};
use crate::install::{InstallOutcome, InstallPhase, Installer};
use crate::metrics::METRICS;
use crate::obs;
use crate::process::{CommandLauncher, LaunchedProcess, ProcessLauncher};
use crate::release::Release;

/// Buffered transitions per subscriber before the slowest one lags.
const EVENT_CAPACITY: usize = 64;

/// Prefix of the installer's staging directories under `downloads/`.
const STAGING_PREFIX: &str = ".stage-";

/// The pluggable edges of the orchestrator.
pub struct Components {
    /// `None` when no release repository is configured; release-dependent
    /// operations then fail with `InvalidState`.
    pub feed: Option<Arc<dyn ReleaseFeed>>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub probe: Arc<dyn HealthProbe>,
    pub platform: HostPlatform,
}

impl Components {
    /// GitHub feed, HTTP downloads, child processes and HTTP health probes
    /// for the detected host.
    pub fn live(config: &CoreConfig) -> Result<Self> {
        let layout = CoreLayout::new(&config.root);
        let feed: Option<Arc<dyn ReleaseFeed>> = match &config.release_repo {
            Some(repo) => Some(Arc::new(GithubReleaseFeed::new(&config.api_base, repo)?)),
            None => None,
        };
        Ok(Self {
            feed,
            fetcher: Arc::new(HttpAssetFetcher::new()?),
            launcher: Arc::new(CommandLauncher::new(
                layout.logs_dir(),
                config.launch_args.clone(),
                config.stop_grace(),
            )),
            probe: Arc::new(HttpHealthProbe::new(
                config.health_path.clone(),
                &config.probe,
            )?),
            platform: HostPlatform::detect()?,
        })
    }
}

/// Result of [`Orchestrator::upgrade`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UpgradeOutcome {
    /// The requested version is already active.
    UpToDate { version: String },
    Promoted {
        version: String,
        previous: Option<String>,
    },
    /// The new version failed its health check and was reverted.
    RolledBack(RollbackReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub from: String,
    pub to: Option<String>,
    /// Failure that triggered the rollback; absent for operator requests.
    pub reason: Option<ErrorInfo>,
}

/// Result of [`Orchestrator::check_health`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "health", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HealthStatus {
    /// No production process is recorded as running.
    NotRunning,
    Healthy { version: String },
    Unhealthy {
        version: String,
        consecutive_failures: u32,
    },
    /// The failure threshold was reached and the last known good version
    /// was restored.
    RolledBack(RollbackReport),
    /// The process was replaced while it was being checked; the
    /// result was discarded.
    Superseded { version: String },
}

/// Owns the lifecycle of the single managed core process.
pub struct Orchestrator {
    config: CoreConfig,
    store: Arc<VersionStore>,
    state: StateStore,
    locks: Arc<LockManager>,
    installer: Installer,
    feed: Option<Arc<dyn ReleaseFeed>>,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthProbe>,
    events: broadcast::Sender<LifecycleState>,
}

impl Orchestrator {
    pub fn from_config(config: CoreConfig) -> Result<Self> {
        let components = Components::live(&config)?;
        Self::with_components(config, components)
    }

    /// Build over an explicit set of components. Creates the core root
    /// layout if it does not exist yet.
    pub fn with_components(config: CoreConfig, components: Components) -> Result<Self> {
        let layout = CoreLayout::new(&config.root);
        let store = Arc::new(VersionStore::open(layout.clone(), config.binary_name.clone())?);
        let locks = Arc::new(LockManager::new(layout.locks_dir()));
        let installer = Installer::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&locks),
            components.fetcher,
            components.platform,
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            state: StateStore::new(layout.state_file()),
            config,
            store,
            locks,
            installer,
            feed: components.feed,
            launcher: components.launcher,
            probe: components.probe,
            events,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn platform(&self) -> &HostPlatform {
        self.installer.platform()
    }

    /// Every lifecycle transition from now on, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleState> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> Result<PersistedCoreState> {
        Ok(self.state.read().await?)
    }

    pub async fn releases(&self) -> Result<Vec<Release>> {
        self.feed()?.releases().await
    }

    /// Delete versions beyond the `keep` newest, never the current one.
    /// Uses the configured retention when `keep` is `None`. Holds the
    /// `upgrade` lock so an in-flight canary is never pruned.
    pub fn prune(&self, keep: Option<usize>) -> Result<PruneReport> {
        let _guard = self.upgrade_guard()?;
        let _span = obs::OperationSpan::enter("prune", "-");
        let report = self.store.prune(keep.unwrap_or(self.config.keep_versions))?;
        obs::emit_prune_completed(&report);
        Ok(report)
    }

    /// Install a release without touching the running process or `current`.
    /// `tag` selects a release; the newest stable one is used otherwise.
    pub async fn install(
        &self,
        tag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        let release = self.resolve_release(tag).await?;
        let progress = |phase: InstallPhase| debug!(phase = phase.as_str(), "install progress");
        self.installer.install(&release, cancel, &progress).await
    }

    /// Launch the current version on the production port and wait for it to
    /// pass its health check. A no-op when it is already running.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<PersistedCoreState> {
        let _guard = self.upgrade_guard()?;
        let doc = self.state.read().await?;
        if let LifecycleState::Running { pid, .. } = doc.lifecycle {
            if self.launcher.is_alive(pid) {
                return Ok(doc);
            }
        }
        if !matches!(
            doc.lifecycle,
            LifecycleState::Idle | LifecycleState::Running { .. }
        ) {
            return Err(CoreError::InvalidState(format!(
                "cannot start while {}",
                doc.lifecycle.name()
            )));
        }
        let version = self.store.current_version().ok_or_else(|| {
            CoreError::InvalidState("no current version; install or upgrade first".into())
        })?;
        let port = self.config.port;

        async {
            self.transition(LifecycleState::Starting {
                target_version: Some(version.clone()),
                port,
            })
            .await?;
            match self.launch_healthy(&version, port, cancel).await {
                Ok(launched) => {
                    self.persist(running(&version, launched, port), |doc| {
                        doc.active_version = Some(version.clone());
                        if doc.last_known_good_version.is_none() {
                            doc.last_known_good_version = Some(version.clone());
                        }
                        doc.record_health_success();
                    })
                    .await
                }
                Err(e) => Err(self.abort(e, LifecycleState::Idle).await),
            }
        }
        .instrument(obs::operation_span("start", &version))
        .await
    }

    /// Stop the production process.
    pub async fn stop(&self) -> Result<PersistedCoreState> {
        let _guard = self.upgrade_guard()?;
        let doc = self.state.read().await?;
        if matches!(doc.lifecycle, LifecycleState::Idle | LifecycleState::Error(_)) {
            return Ok(doc);
        }
        let pid = match &doc.lifecycle {
            LifecycleState::Running { pid, .. } => Some(*pid),
            LifecycleState::Starting { .. } | LifecycleState::Stopping => None,
            other => {
                return Err(CoreError::InvalidState(format!(
                    "cannot stop while {}; run recover first",
                    other.name()
                )))
            }
        };

        self.transition(LifecycleState::Stopping).await?;
        if let Some(pid) = pid {
            if let Err(e) = self.launcher.stop(pid).await {
                return Err(self.abort(e, LifecycleState::Idle).await);
            }
        }
        self.transition(LifecycleState::Idle).await
    }

    /// Install `tag` (or the newest stable release), canary it on the
    /// testing port, promote it and restart production on it. A failed
    /// health check rolls back to the last known good version.
    ///
    /// Holds the `upgrade` lock throughout. When it is taken, fails with
    /// `LockBusy` unless `wait_for_lock` is set.
    pub async fn upgrade(
        &self,
        tag: Option<&str>,
        wait_for_lock: bool,
        cancel: &CancellationToken,
    ) -> Result<UpgradeOutcome> {
        let mut guard = if wait_for_lock {
            self.locks
                .acquire(LockName::Upgrade, self.config.lock_poll_interval(), cancel)
                .await?
        } else {
            self.upgrade_guard()?
        };
        let release = self.resolve_release(tag).await?;
        let version = release.version_string();

        let outcome = self
            .upgrade_locked(&release, &version, cancel)
            .instrument(obs::operation_span("upgrade", &version))
            .await;
        guard.unlock();
        outcome
    }

    async fn upgrade_locked(
        &self,
        release: &Release,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<UpgradeOutcome> {
        let doc = self.state.read().await?;
        if doc.lifecycle.is_transient() {
            return Err(CoreError::InvalidState(format!(
                "an earlier operation was interrupted while {}; run recover first",
                doc.lifecycle.name()
            )));
        }
        if doc.active_version.as_deref() == Some(version)
            && self.store.current_version().as_deref() == Some(version)
        {
            info!(version = %version, "already on the requested version");
            return Ok(UpgradeOutcome::UpToDate {
                version: version.to_string(),
            });
        }
        let resume = self.resume_state(&doc.lifecycle);

        self.persist(
            LifecycleState::Installing {
                version: version.to_string(),
                phase: None,
            },
            |doc| doc.last_upgrade_attempt = Some(UpgradeAttempt::begin(version)),
        )
        .await?;

        let events = self.events.clone();
        let progress = move |phase: InstallPhase| {
            let _ = events.send(LifecycleState::Installing {
                version: version.to_string(),
                phase: Some(phase.as_str().to_string()),
            });
        };
        if let Err(e) = self.installer.install(release, cancel, &progress).await {
            return Err(self.abort(e, resume).await);
        }

        // Canary on the testing port, next to whatever production runs.
        let testing_port = self.config.testing_port;
        let canary = match self.launch(version, testing_port).await {
            Ok(canary) => canary,
            Err(e) => return Err(self.abort(e, resume).await),
        };
        let testing = LifecycleState::Testing {
            version: version.to_string(),
            pid: canary.pid,
            port: testing_port,
            started_at: timestamp::now(),
        };
        if let Err(e) = self.transition(testing).await {
            self.stop_quietly(canary.pid).await;
            return Err(e);
        }
        let probed = await_healthy(
            self.probe.as_ref(),
            version,
            testing_port,
            &self.config.probe,
            cancel,
        )
        .await;
        self.stop_quietly(canary.pid).await;
        match probed {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => return Err(self.abort(e, resume).await),
            Err(e) => {
                let target = rollback_target(&doc, version);
                let report = self.roll_back(version, target, resume, Some(&e), true).await?;
                return Ok(UpgradeOutcome::RolledBack(report));
            }
        }

        let previous = self.store.current_version();
        self.transition(LifecycleState::Promoting {
            version: version.to_string(),
        })
        .await?;
        if let Err(e) = self.store.set_current(version) {
            return Err(self.abort(e.into(), resume).await);
        }
        if let Err(e) = self.store.mark_validated(version) {
            warn!(version = %version, error = %e, "could not record validation time");
        }

        if let LifecycleState::Running { pid, .. } = &resume {
            self.stop_quietly(*pid).await;
        }
        let port = self.config.port;
        let launched = match self.launch_healthy(version, port, cancel).await {
            Ok(launched) => launched,
            Err(e) if e.is_cancelled() => return Err(self.abort(e, LifecycleState::Idle).await),
            Err(e) => {
                let target = rollback_target(&doc, version)
                    .or_else(|| previous.clone().filter(|p| p != version));
                let report = self
                    .roll_back(version, target, LifecycleState::Idle, Some(&e), true)
                    .await?;
                return Ok(UpgradeOutcome::RolledBack(report));
            }
        };

        self.persist(running(version, launched, port), |doc| {
            doc.active_version = Some(version.to_string());
            doc.last_known_good_version = Some(version.to_string());
            doc.record_health_success();
            finish_attempt(doc, attempt_result::PROMOTED, None);
        })
        .await?;
        METRICS.inc_promotions();
        obs::emit_promoted(version, previous.as_deref());

        match self.store.prune(self.config.keep_versions) {
            Ok(report) => obs::emit_prune_completed(&report),
            Err(e) => warn!(error = %e, "prune after promotion failed"),
        }

        Ok(UpgradeOutcome::Promoted {
            version: version.to_string(),
            previous,
        })
    }

    /// Operator-requested rollback from the current version to the last
    /// known good one, or to the newest other installed version when the
    /// current version is itself the last known good one.
    pub async fn rollback(&self) -> Result<RollbackReport> {
        let _guard = self.upgrade_guard()?;
        let doc = self.state.read().await?;
        if doc.lifecycle.is_transient() {
            return Err(CoreError::InvalidState(format!(
                "cannot roll back while {}; run recover first",
                doc.lifecycle.name()
            )));
        }
        let current = self
            .store
            .current_version()
            .ok_or_else(|| CoreError::InvalidState("no current version to roll back".into()))?;
        let target = self.fallback_target(&doc, &current)?.ok_or_else(|| {
            CoreError::InvalidState("no other installed version to roll back to".into())
        })?;

        if let LifecycleState::Running { pid, .. } = &doc.lifecycle {
            self.stop_quietly(*pid).await;
        }
        self.roll_back(&current, Some(target), LifecycleState::Idle, None, false)
            .instrument(obs::operation_span("rollback", &current))
            .await
    }

    /// Probe the production process once. Failures are counted; reaching
    /// the configured threshold rolls back the same way [`rollback`](Self::rollback)
    /// would, when there is a version to go back to.
    pub async fn check_health(&self) -> Result<HealthStatus> {
        let doc = self.state.read().await?;
        let LifecycleState::Running {
            active_version,
            pid,
            port,
            ..
        } = doc.lifecycle
        else {
            return Ok(HealthStatus::NotRunning);
        };

        let checked = if self.launcher.is_alive(pid) {
            self.probe.check(&active_version, port).await
        } else {
            Err(CoreError::Process(format!("pid {pid} is no longer running")))
        };

        let err = match checked {
            Ok(()) => {
                if doc.consecutive_health_failures > 0 {
                    self.state
                        .update(|doc| {
                            if serves(&doc.lifecycle, pid, &active_version) {
                                doc.record_health_success();
                            }
                        })
                        .await?;
                }
                return Ok(HealthStatus::Healthy {
                    version: active_version,
                });
            }
            Err(e) => e,
        };

        // Only count the failure against the process that was checked.
        let mut counted = false;
        let updated = self
            .state
            .update(|doc| {
                if serves(&doc.lifecycle, pid, &active_version) {
                    doc.record_health_failure();
                    counted = true;
                }
            })
            .await?;
        if !counted {
            debug!(pid, version = %active_version, "process replaced during health check");
            return Ok(HealthStatus::Superseded {
                version: active_version,
            });
        }
        let consecutive = updated.consecutive_health_failures;
        METRICS.inc_health_failures();
        obs::emit_health_failed(&active_version, port, consecutive);

        let unhealthy = HealthStatus::Unhealthy {
            version: active_version.clone(),
            consecutive_failures: consecutive,
        };
        let target = self.fallback_target(&updated, &active_version)?;
        if consecutive < self.config.failure_threshold || target.is_none() {
            return Ok(unhealthy);
        }
        let Some(_guard) = self.locks.try_acquire(LockName::Upgrade)? else {
            debug!("upgrade in progress, deferring automatic rollback");
            return Ok(unhealthy);
        };
        let locked = self.state.read().await?;
        if !serves(&locked.lifecycle, pid, &active_version) {
            debug!(pid, version = %active_version, "process replaced before rollback");
            return Ok(HealthStatus::Superseded {
                version: active_version,
            });
        }

        self.stop_quietly(pid).await;
        let report = self
            .roll_back(&active_version, target, LifecycleState::Idle, Some(&err), false)
            .instrument(obs::operation_span("rollback", &active_version))
            .await?;
        Ok(HealthStatus::RolledBack(report))
    }

    /// Reconcile the persisted state after the previous owner died.
    ///
    /// An interrupted promotion is completed and an interrupted rollback is
    /// re-applied. Any other in-flight state stops its recorded process and
    /// returns to idle, closing the upgrade attempt as interrupted. A running
    /// state whose process is gone becomes idle.
    pub async fn recover(&self) -> Result<PersistedCoreState> {
        let _guard = self.upgrade_guard()?;
        self.clear_stale_staging();
        let doc = self.state.read().await?;

        match doc.lifecycle.clone() {
            LifecycleState::Idle | LifecycleState::Error(_) => Ok(doc),
            LifecycleState::Running { pid, .. } if self.launcher.is_alive(pid) => Ok(doc),
            LifecycleState::Promoting { version } => {
                info!(version = %version, "completing interrupted promotion");
                if let Err(e) = self.store.set_current(&version) {
                    return Err(self.abort(e.into(), LifecycleState::Idle).await);
                }
                self.persist(LifecycleState::Idle, |doc| {
                    doc.active_version = Some(version.clone());
                    doc.last_known_good_version = Some(version.clone());
                    finish_attempt(doc, attempt_result::PROMOTED, None);
                })
                .await
            }
            LifecycleState::RollingBack { from, to } => {
                info!(from = %from, to = to.as_deref().unwrap_or("none"), "re-applying interrupted rollback");
                if let Some(to) = &to {
                    if let Err(e) = self.store.set_current(to) {
                        return Err(self.abort(e.into(), LifecycleState::Idle).await);
                    }
                }
                self.persist(LifecycleState::Idle, |doc| {
                    if to.is_some() {
                        doc.active_version = to.clone();
                    }
                    finish_attempt(doc, attempt_result::ROLLED_BACK, None);
                })
                .await
            }
            stale => {
                info!(state = stale.name(), "discarding interrupted state");
                if let Some(pid) = stale.pid() {
                    if self.launcher.is_alive(pid) {
                        self.stop_quietly(pid).await;
                    }
                }
                self.persist(LifecycleState::Idle, |doc| {
                    finish_attempt(doc, attempt_result::INTERRUPTED, None)
                })
                .await
            }
        }
    }

    /// Leave `error` for `idle`. Any other state is returned unchanged.
    pub async fn reset_error(&self) -> Result<PersistedCoreState> {
        let doc = self.state.read().await?;
        if !matches!(doc.lifecycle, LifecycleState::Error(_)) {
            return Ok(doc);
        }
        self.transition(LifecycleState::Idle).await
    }

    // ---------------------------------------------------------------------
    // internals
    // ---------------------------------------------------------------------

    fn feed(&self) -> Result<&dyn ReleaseFeed> {
        self.feed
            .as_deref()
            .ok_or_else(|| CoreError::InvalidState("no release repository configured".into()))
    }

    async fn resolve_release(&self, tag: Option<&str>) -> Result<Release> {
        let feed = self.feed()?;
        let found = match tag {
            Some(tag) => feed.by_tag(tag).await?,
            None => feed.latest().await?,
        };
        found.ok_or_else(|| {
            CoreError::InvalidState(match tag {
                Some(tag) => format!("release {tag} not found"),
                None => "no stable release published".to_string(),
            })
        })
    }

    /// Where to go back to from `current`: the last known good version, or
    /// the newest other installed version when `current` is that version.
    fn fallback_target(&self, doc: &PersistedCoreState, current: &str) -> Result<Option<String>> {
        if let Some(good) = rollback_target(doc, current) {
            return Ok(Some(good));
        }
        Ok(self
            .store
            .list_installed()?
            .into_iter()
            .map(|v| v.version)
            .find(|v| v != current))
    }

    fn upgrade_guard(&self) -> Result<LockGuard> {
        self.locks
            .try_acquire(LockName::Upgrade)?
            .ok_or_else(|| CoreError::LockBusy(LockName::Upgrade.to_string()))
    }

    /// Persist `to` together with `mutate` in one write, then publish it.
    async fn persist<F>(&self, to: LifecycleState, mutate: F) -> Result<PersistedCoreState>
    where
        F: FnOnce(&mut PersistedCoreState),
    {
        let mut from = LifecycleState::Idle;
        let next = to.clone();
        let doc = self
            .state
            .update(|doc| {
                from = std::mem::replace(&mut doc.lifecycle, next);
                mutate(doc);
            })
            .await?;
        if from != to {
            obs::emit_transition(&from, &to);
        }
        // No subscribers is not an error.
        let _ = self.events.send(to);
        Ok(doc)
    }

    async fn transition(&self, to: LifecycleState) -> Result<PersistedCoreState> {
        self.persist(to, |_| {}).await
    }

    /// Close the current operation after `err` and hand the error back.
    ///
    /// Cancellation returns to `resume`. A failure returns to `resume` when
    /// that is a production process still serving, and records `error`
    /// otherwise.
    async fn abort(&self, err: CoreError, resume: LifecycleState) -> CoreError {
        let cancelled = err.is_cancelled();
        let (result, code) = if cancelled {
            (attempt_result::CANCELLED, None)
        } else {
            (attempt_result::FAILED, Some(err.kind().as_str()))
        };
        let to = if cancelled || matches!(resume, LifecycleState::Running { .. }) {
            resume
        } else {
            LifecycleState::Error(ErrorInfo::from(&err))
        };

        warn!(error = %err, "operation aborted");
        if let Err(e) = self
            .persist(to, |doc| finish_attempt(doc, result, code))
            .await
        {
            warn!(error = %e, "could not record aborted operation");
        }
        err
    }

    /// The state to fall back to if an upgrade ends early: the production
    /// process when it is still alive, else idle.
    fn resume_state(&self, lifecycle: &LifecycleState) -> LifecycleState {
        match lifecycle {
            LifecycleState::Running { pid, .. } if self.launcher.is_alive(*pid) => {
                lifecycle.clone()
            }
            _ => LifecycleState::Idle,
        }
    }

    async fn launch(&self, version: &str, port: u16) -> Result<LaunchedProcess> {
        let executable = self.store.executable_path(version)?;
        self.launcher.launch(&executable, version, port).await
    }

    /// Launch `version` on `port` and wait for it to pass its health check.
    /// A process that never becomes healthy is stopped again.
    async fn launch_healthy(
        &self,
        version: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<LaunchedProcess> {
        let launched = self.launch(version, port).await?;
        if let Err(e) =
            await_healthy(self.probe.as_ref(), version, port, &self.config.probe, cancel).await
        {
            self.stop_quietly(launched.pid).await;
            return Err(e);
        }
        Ok(launched)
    }

    async fn stop_quietly(&self, pid: u32) {
        if let Err(e) = self.launcher.stop(pid).await {
            warn!(pid, error = %e, "failed to stop process");
        }
    }

    /// Revert from `from` to `target`.
    ///
    /// When `resume` is a production process still serving `target` it is
    /// kept; otherwise `target` is made current and started on the
    /// production port. Restoring is not cancellable. With no target the
    /// core is left idle.
    async fn roll_back(
        &self,
        from: &str,
        target: Option<String>,
        resume: LifecycleState,
        reason: Option<&CoreError>,
        count_failure: bool,
    ) -> Result<RollbackReport> {
        self.persist(
            LifecycleState::RollingBack {
                from: from.to_string(),
                to: target.clone(),
            },
            |doc| {
                if count_failure {
                    doc.record_health_failure();
                }
            },
        )
        .await?;
        if count_failure {
            METRICS.inc_health_failures();
        }

        let settled = match (&target, &resume) {
            (_, LifecycleState::Running {
                active_version,
                pid,
                ..
            }) if target.as_deref().map_or(true, |t| t == active_version)
                && self.launcher.is_alive(*pid)
                && self.store.current_version().as_deref() == Some(active_version.as_str()) =>
            {
                Ok(resume.clone())
            }
            (Some(to), _) => self.restore(to).await,
            (None, _) => Ok(LifecycleState::Idle),
        };

        let state = match settled {
            Ok(state) => state,
            Err(e) => return Err(self.abort(e, LifecycleState::Idle).await),
        };

        let active = self.store.current_version();
        let code = reason.map(|e| e.kind().as_str());
        self.persist(state, |doc| {
            doc.active_version = active;
            if reason.is_some() {
                finish_attempt(doc, attempt_result::ROLLED_BACK, code);
            }
        })
        .await?;

        METRICS.inc_rollbacks();
        let why = reason.map_or_else(|| "operator request".to_string(), |e| e.to_string());
        obs::emit_rolled_back(from, target.as_deref(), &why);

        Ok(RollbackReport {
            from: from.to_string(),
            to: target,
            reason: reason.map(ErrorInfo::from),
        })
    }

    async fn restore(&self, version: &str) -> Result<LifecycleState> {
        self.store.set_current(version)?;
        let port = self.config.port;
        let launched = self
            .launch_healthy(version, port, &CancellationToken::new())
            .await?;
        Ok(running(version, launched, port))
    }

    /// Remove staging directories left by installs that died midway. Skipped
    /// while another install holds the `install` lock.
    fn clear_stale_staging(&self) {
        let Ok(Some(_guard)) = self.locks.try_acquire(LockName::Install) else {
            return;
        };
        let dir = self.store.layout().downloads_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let stale = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(STAGING_PREFIX));
            if !stale {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => debug!(path = ?entry.path(), "removed stale staging directory"),
                Err(e) => warn!(path = ?entry.path(), error = %e, "could not remove staging directory"),
            }
        }
    }
}

/// Whether `lifecycle` is still production `pid` serving `version`.
fn serves(lifecycle: &LifecycleState, pid: u32, version: &str) -> bool {
    matches!(
        lifecycle,
        LifecycleState::Running { pid: p, active_version, .. } if *p == pid && active_version == version
    )
}

fn running(version: &str, launched: LaunchedProcess, port: u16) -> LifecycleState {
    LifecycleState::Running {
        active_version: version.to_string(),
        pid: launched.pid,
        port,
        started_at: timestamp::now(),
    }
}

/// Last known good version, unless it is `failed` itself.
fn rollback_target(doc: &PersistedCoreState, failed: &str) -> Option<String> {
    doc.last_known_good_version
        .clone()
        .filter(|good| good != failed)
}

/// Close the in-flight upgrade attempt, if there is one.
fn finish_attempt(doc: &mut PersistedCoreState, result: &str, error_code: Option<&str>) {
    if let Some(attempt) = doc
        .last_upgrade_attempt
        .as_mut()
        .filter(|a| !a.is_finished())
    {
        attempt.finish(result, error_code);
    }
}
