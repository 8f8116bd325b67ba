//! Orchestrator lifecycle scenarios, driven end to end over the in-memory
//! feed, launcher and probe.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use corekeeper_core::fakes::{
    write_tar_gz, LocalAssetFetcher, RecordingLauncher, ScriptedHealthProbe, StaticReleaseFeed,
};
use corekeeper_core::{
    Components, CoreConfig, CoreError, CoreLayout, ErrorKind, HealthProbe, HealthStatus, HostArch,
    HostPlatform, LifecycleState, LockName, Orchestrator, OsToken, ProbePolicy, ProcessLauncher,
    Release, ReleaseFeed, UpgradeOutcome,
};
use corekeeper_store::{attempt_result, PersistedCoreState, StateStore, UpgradeAttempt};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

const PORT: u16 = 18317;
const TESTING_PORT: u16 = 18318;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    dir: TempDir,
    assets: PathBuf,
    feed: Arc<StaticReleaseFeed>,
    fetcher: Arc<LocalAssetFetcher>,
    launcher: Arc<RecordingLauncher>,
    probe: Arc<ScriptedHealthProbe>,
    orch: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::build(|scripted, _| scripted as Arc<dyn HealthProbe>)
    }

    /// Like `new`, with the scripted health check wrapped by `wrap`, which also
    /// receives the core root.
    fn build(wrap: impl FnOnce(Arc<ScriptedHealthProbe>, &Path) -> Arc<dyn HealthProbe>) -> Self {
        let dir = tempdir().expect("tempdir");
        let assets = dir.path().join("assets");
        std::fs::create_dir_all(&assets).expect("assets dir");

        let config = CoreConfig::default()
            .with_root(dir.path().join("core"))
            .with_binary_name("core")
            .with_ports(PORT, TESTING_PORT)
            .with_probe(ProbePolicy {
                attempts: 2,
                interval_ms: 1,
                timeout_ms: 50,
            })
            .with_keep_versions(2)
            .with_failure_threshold(3)
            .with_lock_poll_interval(Duration::from_millis(10));

        let feed = Arc::new(StaticReleaseFeed::new(vec![]));
        let fetcher = Arc::new(LocalAssetFetcher::new(&assets));
        let launcher = Arc::new(RecordingLauncher::new());
        let probe = Arc::new(ScriptedHealthProbe::healthy());
        let orch = Orchestrator::with_components(
            config,
            Components {
                feed: Some(feed.clone() as Arc<dyn ReleaseFeed>),
                fetcher: fetcher.clone(),
                launcher: launcher.clone(),
                probe: wrap(probe.clone(), &dir.path().join("core")),
                platform: HostPlatform::new(OsToken::Darwin, HostArch::Arm64),
            },
        )
        .expect("orchestrator");

        Self {
            dir,
            assets,
            feed,
            fetcher,
            launcher,
            probe,
            orch,
        }
    }

    /// Publish `v<version>` with a darwin/arm64 tarball holding `core`.
    fn publish(&self, version: &str) -> Release {
        let name = format!("core_{version}_darwin_arm64.tar.gz");
        let body = format!("#!/bin/sh\necho {version}\n");
        write_tar_gz(&self.assets.join(&name), &[("core", body.as_bytes(), 0o755)])
            .expect("write tarball");
        let release = Release {
            tag_name: format!("v{version}"),
            name: None,
            published_at: None,
            prerelease: false,
            assets: vec![self.fetcher.asset_for(&name, true).expect("asset")],
        };
        self.feed.publish(release.clone());
        release
    }

    async fn upgrade(&self, version: &str) -> UpgradeOutcome {
        self.orch
            .upgrade(Some(version), false, &CancellationToken::new())
            .await
            .expect("upgrade")
    }

    async fn state(&self) -> PersistedCoreState {
        self.orch.state().await.expect("state")
    }

    fn state_store(&self) -> StateStore {
        StateStore::new(self.orch.versions().layout().state_file())
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }
}

fn running_pid(state: &PersistedCoreState) -> u32 {
    match &state.lifecycle {
        LifecycleState::Running { pid, .. } => *pid,
        other => panic!("expected running, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// upgrade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upgrade_from_empty_promotes_and_runs() {
    let h = Harness::new();
    h.publish("1.0.0");

    let outcome = h
        .orch
        .upgrade(None, false, &CancellationToken::new())
        .await
        .expect("upgrade");
    assert_eq!(
        outcome,
        UpgradeOutcome::Promoted {
            version: "1.0.0".into(),
            previous: None
        }
    );

    let state = h.state().await;
    assert_eq!(state.active_version.as_deref(), Some("1.0.0"));
    assert_eq!(state.last_known_good_version.as_deref(), Some("1.0.0"));
    assert_eq!(state.consecutive_health_failures, 0);
    let attempt = state.last_upgrade_attempt.as_ref().expect("attempt");
    assert_eq!(attempt.result.as_deref(), Some(attempt_result::PROMOTED));
    assert!(attempt.is_finished());

    let launches = h.launcher.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[0].port, TESTING_PORT);
    assert_eq!(launches[1].port, PORT);
    assert_eq!(running_pid(&state), launches[1].pid);
    assert!(h.launcher.stops().contains(&launches[0].pid));
    assert_eq!(h.launcher.alive_pids(), vec![launches[1].pid]);

    assert_eq!(h.orch.versions().current_version().as_deref(), Some("1.0.0"));
    assert!(h.orch.versions().current_executable().is_some());
}

#[tokio::test]
async fn upgrade_to_active_version_is_up_to_date() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;

    let again = h.upgrade("v1.0.0").await;
    assert_eq!(
        again,
        UpgradeOutcome::UpToDate {
            version: "1.0.0".into()
        }
    );
    assert_eq!(h.fetcher.fetches(), 1);
}

#[tokio::test]
async fn failed_canary_rolls_back_to_last_known_good() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;
    let production_pid = running_pid(&h.state().await);
    assert_eq!(h.state().await.consecutive_health_failures, 0);

    h.publish("2.0.0");
    h.probe.fail_version("2.0.0");
    let mut events = h.orch.subscribe();

    let outcome = h.upgrade("2.0.0").await;
    let UpgradeOutcome::RolledBack(report) = outcome else {
        panic!("expected rollback, got {outcome:?}");
    };
    assert_eq!(report.from, "2.0.0");
    assert_eq!(report.to.as_deref(), Some("1.0.0"));
    assert_eq!(
        report.reason.as_ref().map(|r| r.kind),
        Some(ErrorKind::HealthCheckFailed)
    );

    let mut seen = Vec::new();
    while let Ok(state) = events.try_recv() {
        seen.push(state);
    }
    assert!(seen.contains(&LifecycleState::RollingBack {
        from: "2.0.0".into(),
        to: Some("1.0.0".into()),
    }));
    assert!(seen
        .iter()
        .any(|s| matches!(s, LifecycleState::Testing { version, .. } if version == "2.0.0")));

    let state = h.state().await;
    assert_eq!(state.consecutive_health_failures, 1);
    assert_eq!(state.active_version.as_deref(), Some("1.0.0"));
    assert_eq!(state.last_known_good_version.as_deref(), Some("1.0.0"));
    // Production was never interrupted.
    assert_eq!(running_pid(&state), production_pid);
    let attempt = state.last_upgrade_attempt.expect("attempt");
    assert_eq!(attempt.version, "2.0.0");
    assert_eq!(attempt.result.as_deref(), Some(attempt_result::ROLLED_BACK));
    assert_eq!(attempt.error_code.as_deref(), Some("healthCheckFailed"));

    assert_eq!(h.orch.versions().current_version().as_deref(), Some("1.0.0"));
    assert_eq!(h.launcher.alive_pids(), vec![production_pid]);
}

#[tokio::test]
async fn failed_production_probe_after_promotion_restores_previous() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;

    h.publish("2.0.0");
    // Canary passes, then both production probes of 2.0.0 fail.
    h.probe.push([true, false, false]);
    let outcome = h.upgrade("2.0.0").await;
    assert!(matches!(outcome, UpgradeOutcome::RolledBack(ref r) if r.to.as_deref() == Some("1.0.0")));

    let state = h.state().await;
    assert_eq!(state.active_version.as_deref(), Some("1.0.0"));
    assert_eq!(state.consecutive_health_failures, 1);
    assert_eq!(h.orch.versions().current_version().as_deref(), Some("1.0.0"));

    let last = h.launcher.launches().last().cloned().expect("launch");
    assert_eq!(last.version, "1.0.0");
    assert_eq!(last.port, PORT);
    assert_eq!(running_pid(&state), last.pid);
}

#[tokio::test]
async fn failed_promotion_without_known_good_restores_previous_current() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.orch
        .install(Some("1.0.0"), &CancellationToken::new())
        .await
        .expect("install 1.0.0");
    h.orch.versions().set_current("1.0.0").expect("set current");
    assert!(h.state().await.last_known_good_version.is_none());

    h.publish("2.0.0");
    h.probe.push([true, false, false]);
    let outcome = h.upgrade("2.0.0").await;
    assert!(matches!(outcome, UpgradeOutcome::RolledBack(ref r) if r.to.as_deref() == Some("1.0.0")));

    assert_eq!(h.orch.versions().current_version().as_deref(), Some("1.0.0"));
    let state = h.state().await;
    assert_eq!(state.active_version.as_deref(), Some("1.0.0"));
    assert_eq!(running_pid(&state), h.launcher.launches().last().expect("launch").pid);
}

#[tokio::test]
async fn canary_failure_without_known_good_leaves_core_idle() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.probe.fail_version("1.0.0");

    let outcome = h.upgrade("1.0.0").await;
    assert!(matches!(outcome, UpgradeOutcome::RolledBack(ref r) if r.to.is_none()));

    let state = h.state().await;
    assert_eq!(state.lifecycle, LifecycleState::Idle);
    assert!(h.orch.versions().current_version().is_none());
    assert!(h.launcher.alive_pids().is_empty());
}

#[tokio::test]
async fn busy_upgrade_lock_fails_fast() {
    let h = Harness::new();
    h.publish("1.0.0");
    let held = h
        .orch
        .locks()
        .try_acquire(LockName::Upgrade)
        .expect("try_acquire")
        .expect("free");

    let err = h
        .orch
        .upgrade(None, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockBusy);
    assert!(h.state().await.last_upgrade_attempt.is_none());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h.orch.upgrade(None, true, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    drop(held);
    let outcome = h
        .orch
        .upgrade(None, true, &CancellationToken::new())
        .await
        .expect("upgrade after release");
    assert!(matches!(outcome, UpgradeOutcome::Promoted { .. }));
}

#[tokio::test]
async fn prune_refuses_while_upgrade_lock_held() {
    let h = Harness::new();
    for version in ["1.0.0", "2.0.0"] {
        h.publish(version);
        h.orch
            .install(Some(version), &CancellationToken::new())
            .await
            .expect("install");
    }
    let held = h
        .orch
        .locks()
        .try_acquire(LockName::Upgrade)
        .expect("try_acquire")
        .expect("free");

    let err = h.orch.prune(Some(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockBusy);
    assert_eq!(h.orch.versions().list_installed().unwrap().len(), 2);

    drop(held);
    let report = h.orch.prune(Some(1)).expect("prune");
    assert_eq!(report.removed.len(), 1);
    assert_eq!(h.orch.versions().list_installed().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_launch_records_error_until_reset() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.launcher.refuse_version("1.0.0");

    let err = h
        .orch
        .upgrade(None, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessError);

    let state = h.state().await;
    let LifecycleState::Error(info) = &state.lifecycle else {
        panic!("expected error, got {:?}", state.lifecycle);
    };
    assert_eq!(info.kind, ErrorKind::ProcessError);
    let attempt = state.last_upgrade_attempt.as_ref().expect("attempt");
    assert_eq!(attempt.result.as_deref(), Some(attempt_result::FAILED));
    assert_eq!(attempt.error_code.as_deref(), Some("processError"));

    let reset = h.orch.reset_error().await.expect("reset");
    assert_eq!(reset.lifecycle, LifecycleState::Idle);
    // Resetting a non-error state changes nothing.
    let again = h.orch.reset_error().await.expect("reset");
    assert_eq!(again.lifecycle, LifecycleState::Idle);
}

#[tokio::test]
async fn install_failure_keeps_production_running() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;
    let production_pid = running_pid(&h.state().await);

    let mut broken = h.publish("2.0.0");
    broken.assets[0].digest = Some(format!("sha256:{}", "0".repeat(64)));
    h.feed.publish(broken);

    let err = h
        .orch
        .upgrade(Some("2.0.0"), false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);

    let state = h.state().await;
    assert_eq!(running_pid(&state), production_pid);
    assert_eq!(
        state.last_upgrade_attempt.and_then(|a| a.error_code).as_deref(),
        Some("checksumMismatch")
    );
    assert!(h.orch.versions().installed("2.0.0").unwrap().is_none());
}

// ---------------------------------------------------------------------------
// start / stop / rollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_then_start_relaunches_current() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;
    let first = running_pid(&h.state().await);

    let stopped = h.orch.stop().await.expect("stop");
    assert_eq!(stopped.lifecycle, LifecycleState::Idle);
    assert!(!h.launcher.is_alive(first));

    let cancel = CancellationToken::new();
    let started = h.orch.start(&cancel).await.expect("start");
    let second = running_pid(&started);
    assert_ne!(first, second);

    let again = h.orch.start(&cancel).await.expect("start twice");
    assert_eq!(running_pid(&again), second);
    assert_eq!(h.orch.stop().await.expect("stop").lifecycle, LifecycleState::Idle);
    assert_eq!(h.orch.stop().await.expect("stop idle").lifecycle, LifecycleState::Idle);
}

#[tokio::test]
async fn start_without_current_version_is_invalid() {
    let h = Harness::new();
    let err = h.orch.start(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn operator_rollback_goes_to_previous_install() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;
    h.publish("2.0.0");
    h.upgrade("2.0.0").await;

    let report = h.orch.rollback().await.expect("rollback");
    assert_eq!(report.from, "2.0.0");
    assert_eq!(report.to.as_deref(), Some("1.0.0"));
    assert!(report.reason.is_none());

    let state = h.state().await;
    assert_eq!(state.active_version.as_deref(), Some("1.0.0"));
    assert_eq!(h.orch.versions().current_version().as_deref(), Some("1.0.0"));
    // The last upgrade attempt itself succeeded and stays recorded as such.
    assert_eq!(
        state.last_upgrade_attempt.and_then(|a| a.result).as_deref(),
        Some(attempt_result::PROMOTED)
    );
}

// ---------------------------------------------------------------------------
// check_health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_success_resets_failure_counter() {
    let h = Harness::new();
    assert_eq!(h.orch.check_health().await.unwrap(), HealthStatus::NotRunning);

    h.publish("1.0.0");
    h.upgrade("1.0.0").await;

    h.probe.push([false]);
    assert_eq!(
        h.orch.check_health().await.unwrap(),
        HealthStatus::Unhealthy {
            version: "1.0.0".into(),
            consecutive_failures: 1
        }
    );
    assert_eq!(
        h.orch.check_health().await.unwrap(),
        HealthStatus::Healthy {
            version: "1.0.0".into()
        }
    );
    assert_eq!(h.state().await.consecutive_health_failures, 0);
}

#[tokio::test]
async fn crashed_process_counts_as_failed_check() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;
    h.launcher.crash(running_pid(&h.state().await));

    let status = h.orch.check_health().await.unwrap();
    assert!(matches!(
        status,
        HealthStatus::Unhealthy {
            consecutive_failures: 1,
            ..
        }
    ));
    // Canary and production probes only; a dead process is not probed.
    assert_eq!(h.probe.calls(), 2);
}

/// Fails once while an upgrade swaps in a new production process.
struct ReplacedDuringCheck {
    inner: Arc<ScriptedHealthProbe>,
    state: StateStore,
    armed: AtomicBool,
}

#[async_trait]
impl HealthProbe for ReplacedDuringCheck {
    async fn check(&self, version: &str, port: u16) -> corekeeper_core::Result<()> {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return self.inner.check(version, port).await;
        }
        self.state
            .update(|doc| {
                if let LifecycleState::Running { pid, .. } = &mut doc.lifecycle {
                    *pid += 1000;
                }
                doc.consecutive_health_failures = 0;
            })
            .await?;
        Err(CoreError::Process("connection refused".into()))
    }
}

#[tokio::test]
async fn failure_of_replaced_process_is_not_counted() {
    let mut wrapper = None;
    let h = Harness::build(|scripted, root| {
        let checker = Arc::new(ReplacedDuringCheck {
            inner: scripted,
            state: StateStore::new(CoreLayout::new(root).state_file()),
            armed: AtomicBool::new(false),
        });
        wrapper = Some(checker.clone());
        checker as Arc<dyn HealthProbe>
    });
    let checker = wrapper.expect("wrapped health check");
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;
    let checked_pid = running_pid(&h.state().await);

    checker.armed.store(true, Ordering::SeqCst);
    assert_eq!(
        h.orch.check_health().await.unwrap(),
        HealthStatus::Superseded {
            version: "1.0.0".into()
        }
    );

    let state = h.state().await;
    assert_eq!(state.consecutive_health_failures, 0);
    assert_eq!(running_pid(&state), checked_pid + 1000);
    assert!(h.launcher.stops().iter().all(|pid| *pid != checked_pid));
}

#[tokio::test]
async fn repeated_health_failures_trigger_automatic_rollback() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;
    h.publish("2.0.0");
    h.upgrade("2.0.0").await;
    let failing_pid = running_pid(&h.state().await);

    h.probe.fail_version("2.0.0");
    for expected in 1..3 {
        assert_eq!(
            h.orch.check_health().await.unwrap(),
            HealthStatus::Unhealthy {
                version: "2.0.0".into(),
                consecutive_failures: expected
            }
        );
    }
    let status = h.orch.check_health().await.unwrap();
    let HealthStatus::RolledBack(report) = status else {
        panic!("expected rollback, got {status:?}");
    };
    assert_eq!(report.from, "2.0.0");
    assert_eq!(report.to.as_deref(), Some("1.0.0"));

    let state = h.state().await;
    assert_eq!(state.active_version.as_deref(), Some("1.0.0"));
    assert_eq!(state.consecutive_health_failures, 3);
    assert!(!h.launcher.is_alive(failing_pid));
    assert_eq!(h.orch.versions().current_version().as_deref(), Some("1.0.0"));

    // The restored version is healthy, which clears the counter.
    assert!(matches!(
        h.orch.check_health().await.unwrap(),
        HealthStatus::Healthy { .. }
    ));
    assert_eq!(h.state().await.consecutive_health_failures, 0);
}

// ---------------------------------------------------------------------------
// recover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recover_completes_interrupted_promotion() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.orch
        .install(Some("1.0.0"), &CancellationToken::new())
        .await
        .expect("install");

    let mut doc = PersistedCoreState::default();
    doc.lifecycle = LifecycleState::Promoting {
        version: "1.0.0".into(),
    };
    doc.last_upgrade_attempt = Some(UpgradeAttempt::begin("1.0.0"));
    h.state_store().write(&doc).await.expect("seed state");

    let recovered = h.orch.recover().await.expect("recover");
    assert_eq!(recovered.lifecycle, LifecycleState::Idle);
    assert_eq!(recovered.active_version.as_deref(), Some("1.0.0"));
    assert_eq!(recovered.last_known_good_version.as_deref(), Some("1.0.0"));
    assert_eq!(
        recovered.last_upgrade_attempt.and_then(|a| a.result).as_deref(),
        Some(attempt_result::PROMOTED)
    );
    assert_eq!(h.orch.versions().current_version().as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn recover_stops_orphaned_canary() {
    let h = Harness::new();
    let canary = h
        .launcher
        .launch(Path::new("/nowhere/core"), "2.0.0", TESTING_PORT)
        .await
        .expect("launch");

    let mut doc = PersistedCoreState::default();
    doc.lifecycle = LifecycleState::Testing {
        version: "2.0.0".into(),
        pid: canary.pid,
        port: TESTING_PORT,
        started_at: corekeeper_store::timestamp::now(),
    };
    doc.last_upgrade_attempt = Some(UpgradeAttempt::begin("2.0.0"));
    h.state_store().write(&doc).await.expect("seed state");

    let recovered = h.orch.recover().await.expect("recover");
    assert_eq!(recovered.lifecycle, LifecycleState::Idle);
    assert_eq!(h.launcher.stops(), vec![canary.pid]);
    assert_eq!(
        recovered.last_upgrade_attempt.and_then(|a| a.result).as_deref(),
        Some(attempt_result::INTERRUPTED)
    );
}

#[tokio::test]
async fn recover_reapplies_rollback_and_clears_staging() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;
    h.publish("2.0.0");
    h.orch
        .install(Some("2.0.0"), &CancellationToken::new())
        .await
        .expect("install");
    h.orch.versions().set_current("2.0.0").expect("set current");

    let mut doc = h.state().await;
    doc.lifecycle = LifecycleState::RollingBack {
        from: "2.0.0".into(),
        to: Some("1.0.0".into()),
    };
    h.state_store().write(&doc).await.expect("seed state");
    let stale = h.orch.versions().layout().downloads_dir().join(".stage-dead");
    std::fs::create_dir_all(stale.join("unpacked")).expect("stale staging");

    let recovered = h.orch.recover().await.expect("recover");
    assert_eq!(recovered.lifecycle, LifecycleState::Idle);
    assert_eq!(recovered.active_version.as_deref(), Some("1.0.0"));
    assert_eq!(h.orch.versions().current_version().as_deref(), Some("1.0.0"));
    assert!(!stale.exists());
}

#[tokio::test]
async fn recover_keeps_live_process_and_drops_dead_one() {
    let h = Harness::new();
    h.publish("1.0.0");
    h.upgrade("1.0.0").await;
    let pid = running_pid(&h.state().await);

    let kept = h.orch.recover().await.expect("recover");
    assert_eq!(running_pid(&kept), pid);

    h.launcher.crash(pid);
    let dropped = h.orch.recover().await.expect("recover");
    assert_eq!(dropped.lifecycle, LifecycleState::Idle);
    assert!(h.root().join("core/state.json").is_file());
}
