//! In-process fakes for the network and process seams (testing only)
//!
//! Provides `StaticReleaseFeed`, `LocalAssetFetcher`, `RecordingLauncher` and
//! `ScriptedHealthProbe` so the orchestrator can be driven end to end with
//! no network access and no real core binary.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use corekeeper_store::{hasher, StoreError};

use crate::error::{CoreError, Result};
use crate::fetch::{download_paths, AssetFetcher};
use crate::health::HealthProbe;
use crate::process::{LaunchedProcess, ProcessLauncher};
use crate::release::{Asset, Release};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// StaticReleaseFeed
// ---------------------------------------------------------------------------

/// Feed returning a fixed list of releases.
#[derive(Debug, Default)]
pub struct StaticReleaseFeed {
    releases: Mutex<Vec<Release>>,
}

impl StaticReleaseFeed {
    pub fn new(releases: Vec<Release>) -> Self {
        Self {
            releases: Mutex::new(releases),
        }
    }

    /// Publish `release` as the newest one.
    pub fn publish(&self, release: Release) {
        locked(&self.releases).insert(0, release);
    }
}

#[async_trait]
impl crate::feed::ReleaseFeed for StaticReleaseFeed {
    async fn releases(&self) -> Result<Vec<Release>> {
        Ok(locked(&self.releases).clone())
    }
}

// ---------------------------------------------------------------------------
// LocalAssetFetcher
// ---------------------------------------------------------------------------

/// Serves assets from a local directory, looked up by asset name.
#[derive(Debug)]
pub struct LocalAssetFetcher {
    dir: PathBuf,
    fetches: AtomicUsize,
}

impl LocalAssetFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Asset pointing at `<dir>/<name>` with its real size and, when
    /// `declare_digest`, its real `sha256:` digest.
    pub fn asset_for(&self, name: &str, declare_digest: bool) -> Result<Asset> {
        let path = self.dir.join(name);
        let size = std::fs::metadata(&path)
            .map_err(|e| StoreError::from_io(&path, e))?
            .len();
        let digest = if declare_digest {
            Some(format!("sha256:{}", hasher::sha256_file(&path)?))
        } else {
            None
        };
        Ok(Asset {
            name: name.to_string(),
            download_url: format!("file://{}", path.display()),
            size,
            digest,
            content_type: Some("application/gzip".into()),
        })
    }
}

#[async_trait]
impl AssetFetcher for LocalAssetFetcher {
    async fn fetch(
        &self,
        asset: &Asset,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled(format!("download of {}", asset.name)));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (dest, partial) = download_paths(asset, dest_dir)?;
        let source = self.dir.join(&asset.name);
        tokio::fs::copy(&source, &partial)
            .await
            .map_err(|e| CoreError::Download {
                url: asset.download_url.clone(),
                message: e.to_string(),
            })?;
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| StoreError::from_write(&dest, e))?;
        Ok(dest)
    }
}

// ---------------------------------------------------------------------------
// RecordingLauncher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub version: String,
    pub executable: PathBuf,
    pub port: u16,
    pub pid: u32,
}

/// Launcher that starts nothing and remembers every call.
#[derive(Debug)]
pub struct RecordingLauncher {
    next_pid: AtomicU32,
    launches: Mutex<Vec<LaunchRecord>>,
    stops: Mutex<Vec<u32>>,
    alive: Mutex<HashSet<u32>>,
    refuse: Mutex<HashSet<String>>,
}

impl Default for RecordingLauncher {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(40_000),
            launches: Mutex::default(),
            stops: Mutex::default(),
            alive: Mutex::default(),
            refuse: Mutex::default(),
        }
    }
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make launches of `version` fail with a process error.
    pub fn refuse_version(&self, version: &str) {
        locked(&self.refuse).insert(version.to_string());
    }

    /// Simulate `pid` dying on its own.
    pub fn crash(&self, pid: u32) {
        locked(&self.alive).remove(&pid);
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        locked(&self.launches).clone()
    }

    pub fn stops(&self) -> Vec<u32> {
        locked(&self.stops).clone()
    }

    pub fn alive_pids(&self) -> Vec<u32> {
        let mut pids: Vec<_> = locked(&self.alive).iter().copied().collect();
        pids.sort_unstable();
        pids
    }
}

#[async_trait]
impl ProcessLauncher for RecordingLauncher {
    async fn launch(&self, executable: &Path, version: &str, port: u16) -> Result<LaunchedProcess> {
        if locked(&self.refuse).contains(version) {
            return Err(CoreError::Process(format!("refusing to launch {version}")));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        locked(&self.launches).push(LaunchRecord {
            version: version.to_string(),
            executable: executable.to_path_buf(),
            port,
            pid,
        });
        locked(&self.alive).insert(pid);
        Ok(LaunchedProcess { pid })
    }

    async fn stop(&self, pid: u32) -> Result<()> {
        locked(&self.stops).push(pid);
        locked(&self.alive).remove(&pid);
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        locked(&self.alive).contains(&pid)
    }
}

// ---------------------------------------------------------------------------
// ScriptedHealthProbe
// ---------------------------------------------------------------------------

/// Probe answering from a script of outcomes, then healthy once the script
/// runs out. Versions marked with [`fail_version`](Self::fail_version)
/// always fail.
#[derive(Debug, Default)]
pub struct ScriptedHealthProbe {
    script: Mutex<VecDeque<bool>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl ScriptedHealthProbe {
    pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn fail_version(&self, version: &str) {
        locked(&self.failing).insert(version.to_string());
    }

    pub fn heal_version(&self, version: &str) {
        locked(&self.failing).remove(version);
    }

    /// Append outcomes to the script.
    pub fn push(&self, outcomes: impl IntoIterator<Item = bool>) {
        locked(&self.script).extend(outcomes);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedHealthProbe {
    async fn check(&self, version: &str, port: u16) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = locked(&self.script).pop_front().unwrap_or(true);
        let forced_failure = locked(&self.failing).contains(version);
        if scripted && !forced_failure {
            Ok(())
        } else {
            Err(CoreError::HealthCheckFailed {
                version: version.to_string(),
                port,
                message: "scripted failure".into(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Archive fixtures
// ---------------------------------------------------------------------------

/// Write a gzip tarball at `path` holding `entries` (`name`, bytes, mode).
pub fn write_tar_gz(path: &Path, entries: &[(&str, &[u8], u32)]) -> Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let fail = |e: std::io::Error| StoreError::from_write(path, e);
    let file = std::fs::File::create(path).map_err(fail)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, body, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append_data(&mut header, name, *body).map_err(fail)?;
    }
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(fail)?;
    Ok(())
}

/// Write an uncompressed zip at `path` holding `entries` (`name`, bytes,
/// unix mode).
pub fn write_zip(path: &Path, entries: &[(&str, &[u8], u32)]) -> Result<()> {
    const DOS_DATE_1980_01_01: u16 = (1 << 5) | 1;
    const MADE_BY_UNIX: u16 = (3 << 8) | 20;

    let mut out = Vec::new();
    let mut central = Vec::new();
    for (name, body, mode) in entries {
        let offset = out.len() as u32;
        let crc = crc32(body);
        let size = body.len() as u32;

        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        for field in [20u16, 0, 0, 0, DOS_DATE_1980_01_01] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for field in [crc, size, size] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(body);

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        for field in [MADE_BY_UNIX, 20, 0, 0, 0, DOS_DATE_1980_01_01] {
            central.extend_from_slice(&field.to_le_bytes());
        }
        for field in [crc, size, size] {
            central.extend_from_slice(&field.to_le_bytes());
        }
        for field in [name.len() as u16, 0, 0, 0, 0] {
            central.extend_from_slice(&field.to_le_bytes());
        }
        central.extend_from_slice(&((0o100_000 | mode) << 16).to_le_bytes());
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name.as_bytes());
    }

    let central_offset = out.len() as u32;
    let count = entries.len() as u16;
    out.extend_from_slice(&central);
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    for field in [0u16, 0, count, count] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&central_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());

    std::fs::write(path, out).map_err(|e| StoreError::from_write(path, e))?;
    Ok(())
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for byte in bytes {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Whether the host `unzip` tool needed for zip assets is installed.
pub fn unzip_available() -> bool {
    std::process::Command::new("unzip")
        .arg("-v")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ReleaseFeed;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[tokio::test]
    async fn test_recording_launcher_tracks_liveness() {
        let launcher = RecordingLauncher::new();
        let a = launcher.launch(Path::new("/x/core"), "1.0.0", 1).await.unwrap();
        let b = launcher.launch(Path::new("/x/core"), "2.0.0", 2).await.unwrap();
        assert_ne!(a.pid, b.pid);
        assert!(launcher.is_alive(a.pid));

        launcher.crash(a.pid);
        assert!(!launcher.is_alive(a.pid));
        launcher.stop(b.pid).await.unwrap();
        assert_eq!(launcher.stops(), vec![b.pid]);
        assert!(launcher.alive_pids().is_empty());

        launcher.refuse_version("3.0.0");
        assert!(launcher.launch(Path::new("/x/core"), "3.0.0", 3).await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_probe() {
        let probe = ScriptedHealthProbe::new([false]);
        assert!(probe.check("1.0.0", 1).await.is_err());
        assert!(probe.check("1.0.0", 1).await.is_ok());
        probe.fail_version("1.0.0");
        assert!(probe.check("1.0.0", 1).await.is_err());
        assert!(probe.check("2.0.0", 1).await.is_ok());
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test]
    async fn test_local_fetcher_and_static_feed() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_tar_gz(&src.path().join("core_linux_arm64.tar.gz"), &[("core", b"x", 0o755)]).unwrap();

        let fetcher = LocalAssetFetcher::new(src.path());
        let asset = fetcher.asset_for("core_linux_arm64.tar.gz", true).unwrap();
        assert!(asset.sha256_digest().is_some());

        let path = fetcher
            .fetch(&asset, dest.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            hasher::sha256_file(&path).unwrap(),
            asset.sha256_digest().unwrap()
        );
        assert_eq!(fetcher.fetches(), 1);

        let feed = StaticReleaseFeed::new(vec![]);
        feed.publish(Release {
            tag_name: "v1.0.0".into(),
            name: None,
            published_at: None,
            prerelease: false,
            assets: vec![asset],
        });
        assert_eq!(feed.latest().await.unwrap().unwrap().version_string(), "1.0.0");
    }
}
