//! Installing a release as a new version directory.
//!
//! Everything happens inside a private staging directory under `downloads/`
//! and is handed to the version store with a single rename, so a failure at
//! any step leaves `versions/` exactly as it was.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use corekeeper_store::{
    hasher, persist, BinaryInfo, InstalledVersion, LockManager, LockName, SourceInfo, StoreError,
    VersionMetadata, VersionStore,
};

use crate::arch::{HostPlatform, SniffedBinary};
use crate::archive::{locate_binary, unpack};
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::fetch::AssetFetcher;
use crate::metrics::METRICS;
use crate::obs;
use crate::release::{select_asset, Release};

/// Progress labels reported while installing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Downloading,
    Verifying,
    Unpacking,
    Staging,
}

impl InstallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallPhase::Downloading => "downloading",
            InstallPhase::Verifying => "verifying",
            InstallPhase::Unpacking => "unpacking",
            InstallPhase::Staging => "staging",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub installed: InstalledVersion,
    /// False when the version was already present and nothing was fetched.
    pub fresh: bool,
}

pub struct Installer {
    store: Arc<VersionStore>,
    locks: Arc<LockManager>,
    fetcher: Arc<dyn AssetFetcher>,
    platform: HostPlatform,
    candidates: Vec<String>,
    config: CoreConfig,
}

impl Installer {
    pub fn new(
        config: &CoreConfig,
        store: Arc<VersionStore>,
        locks: Arc<LockManager>,
        fetcher: Arc<dyn AssetFetcher>,
        platform: HostPlatform,
    ) -> Self {
        Self {
            store,
            locks,
            fetcher,
            platform,
            candidates: config.binary_candidates(),
            config: config.clone(),
        }
    }

    pub fn platform(&self) -> &HostPlatform {
        &self.platform
    }

    /// Install `release` under the `install` lock, waiting for the lock if
    /// another caller holds it.
    pub async fn install(
        &self,
        release: &Release,
        cancel: &CancellationToken,
        on_phase: &(dyn Fn(InstallPhase) + Send + Sync),
    ) -> Result<InstallOutcome> {
        let version = release.version_string();
        corekeeper_store::validate_version(&version)?;

        async {
            let mut guard = self
                .locks
                .acquire(LockName::Install, self.config.lock_poll_interval(), cancel)
                .await?;
            let outcome = self.install_locked(release, &version, cancel, on_phase).await;
            guard.unlock();
            outcome
        }
        .instrument(obs::operation_span("install", &version))
        .await
    }

    async fn install_locked(
        &self,
        release: &Release,
        version: &str,
        cancel: &CancellationToken,
        on_phase: &(dyn Fn(InstallPhase) + Send + Sync),
    ) -> Result<InstallOutcome> {
        let asset = select_asset(release, &self.platform)?;
        let kind = asset.archive_kind().ok_or_else(|| CoreError::NoMatchingAsset {
            tag: release.tag_name.clone(),
            platform: self.platform.to_string(),
        })?;

        if let Some(existing) = self.store.installed(version)? {
            debug!(version = %version, "already installed");
            return Ok(InstallOutcome {
                installed: existing,
                fresh: false,
            });
        }

        let layout = self.store.layout();
        if let Err(e) = persist::write_json_atomic(&layout.release_file(version)?, release) {
            warn!(version = %version, error = %e, "could not cache release document");
        }

        let staging = tempfile::Builder::new()
            .prefix(".stage-")
            .tempdir_in(layout.downloads_dir())
            .map_err(|e| StoreError::from_write(&layout.downloads_dir(), e))?;

        on_phase(InstallPhase::Downloading);
        let archive = self.fetcher.fetch(asset, staging.path(), cancel).await?;

        on_phase(InstallPhase::Verifying);
        let archive_sha = match asset.sha256_digest() {
            Some(expected) => {
                let expected = expected.to_string();
                let path = archive.clone();
                match tokio::task::spawn_blocking(move || hasher::verify_file(&path, &expected))
                    .await?
                {
                    Ok(digest) => digest,
                    Err(e) => {
                        let _ = std::fs::remove_file(&archive);
                        return Err(e.into());
                    }
                }
            }
            None => {
                warn!(asset = %asset.name, "release declares no sha256 digest");
                hash_blocking(archive.clone()).await?
            }
        };

        on_phase(InstallPhase::Unpacking);
        let unpacked = staging.path().join("unpacked");
        unpack(&archive, kind, &unpacked).await?;
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled(format!("install of {version}")));
        }

        on_phase(InstallPhase::Staging);
        let found = locate_binary(&unpacked, &self.candidates).ok_or_else(|| {
            StoreError::BinaryMissing {
                version: version.to_string(),
                path: unpacked.clone(),
            }
        })?;
        let version_dir = staging.path().join("version");
        let binary_info = self.stage_binary(version, &found, &version_dir).await?;

        let metadata = VersionMetadata::new(
            version,
            SourceInfo {
                repo: self.config.release_repo.clone(),
                tag: release.tag_name.clone(),
                asset_name: asset.name.clone(),
                asset_url: asset.download_url.clone(),
                asset_sha256: Some(archive_sha),
            },
            binary_info,
        );
        metadata.save(&version_dir.join(corekeeper_store::layout::METADATA_FILE))?;

        let installed = self.store.adopt(&version_dir, version)?;
        METRICS.inc_installs();
        obs::emit_install_completed(version, &metadata.binary.sha256, &asset.name);
        Ok(InstallOutcome {
            installed,
            fresh: true,
        })
    }

    /// Copy the located binary into `version_dir` under its final name and
    /// describe it. The copy is re-hashed; any difference from the source is
    /// a checksum failure.
    async fn stage_binary(
        &self,
        version: &str,
        found: &Path,
        version_dir: &Path,
    ) -> Result<BinaryInfo> {
        std::fs::create_dir_all(version_dir)
            .map_err(|e| StoreError::from_write(version_dir, e))?;
        let dest = version_dir.join(&self.config.binary_name);

        let source_sha = hash_blocking(found.to_path_buf()).await?;
        std::fs::copy(found, &dest).map_err(|e| StoreError::from_write(&dest, e))?;
        make_executable(&dest)?;
        let installed_sha = hash_blocking(dest.clone()).await?;
        if !hasher::digests_match(&source_sha, &installed_sha) {
            return Err(StoreError::ChecksumMismatch {
                path: dest,
                expected: source_sha,
                actual: installed_sha,
            }
            .into());
        }

        let sniffed = SniffedBinary::sniff(&dest)?;
        if !sniffed.archs.is_empty() && !sniffed.archs.iter().any(|a| self.platform.can_run(*a)) {
            return Err(CoreError::UnsupportedPlatform(format!(
                "{version} is built for {} and cannot run on {}",
                sniffed.arch_label().unwrap_or_default(),
                self.platform
            )));
        }

        let archive_name = found
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| *n != self.config.binary_name)
            .map(str::to_string);

        Ok(BinaryInfo {
            archive_name,
            name: self.config.binary_name.clone(),
            sha256: installed_sha,
            arch: sniffed
                .arch_label()
                .or_else(|| Some(self.platform.arch.to_string())),
            format: Some(sniffed.format.as_str().to_string()),
            executable: true,
        })
    }
}

async fn hash_blocking(path: PathBuf) -> Result<String> {
    Ok(tokio::task::spawn_blocking(move || hasher::sha256_file(&path)).await??)
}

fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| StoreError::from_write(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
