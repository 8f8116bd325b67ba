//! Side-by-side installed versions and the `current` symlink.
//!
//! The store exclusively owns `versions/` and `current`. Mutations are
//! serialized within the process by an internal mutex; reads never take it,
//! so listing can observe an install in progress. That is safe because a
//! version only becomes visible under its final name through [`VersionStore::adopt`]
//! and only becomes live through [`VersionStore::set_current`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::layout::{validate_version, CoreLayout, METADATA_FILE, VERSIONS_DIR};
use crate::metadata::VersionMetadata;

/// Retention used when callers do not specify one.
pub const DEFAULT_KEEP: usize = 2;

/// One installed version as seen at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledVersion {
    pub version: String,
    #[serde(with = "crate::timestamp")]
    pub installed_at: DateTime<Utc>,
    pub executable: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    pub is_current: bool,
}

/// What a prune pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub kept: Vec<String>,
    pub removed: Vec<String>,
    /// Stale versions whose deletion failed; left in place.
    pub failed: Vec<String>,
}

#[derive(Debug)]
pub struct VersionStore {
    layout: CoreLayout,
    binary_name: String,
    gate: Mutex<()>,
}

impl VersionStore {
    /// Open the store rooted at `layout`, creating the directory tree if needed.
    pub fn open(layout: CoreLayout, binary_name: impl Into<String>) -> Result<Self> {
        layout.ensure()?;
        Ok(Self {
            layout,
            binary_name: binary_name.into(),
            gate: Mutex::new(()),
        })
    }

    pub fn layout(&self) -> &CoreLayout {
        &self.layout
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// Path the executable of `version` has (or would have).
    pub fn executable_path(&self, version: &str) -> Result<PathBuf> {
        Ok(self.layout.version_dir(version)?.join(&self.binary_name))
    }

    /// Version `current` resolves to. `None` when the link is absent or
    /// dangling; never an error.
    pub fn current_version(&self) -> Option<String> {
        let link = self.layout.current_link();
        let meta = std::fs::symlink_metadata(&link).ok()?;
        if !meta.file_type().is_symlink() {
            warn!(path = ?link, "current exists but is not a symlink");
            return None;
        }
        let resolved = std::fs::canonicalize(&link).ok()?;
        if !resolved.is_dir() {
            return None;
        }
        resolved.file_name()?.to_str().map(str::to_string)
    }

    /// Executable behind `current`, only if it is present and executable.
    pub fn current_executable(&self) -> Option<PathBuf> {
        let version = self.current_version()?;
        let path = self.executable_path(&version).ok()?;
        is_executable(&path).then_some(path)
    }

    /// Point `current` at `version`.
    ///
    /// The target is checked before anything is touched, so a missing version
    /// or binary leaves `current` as it was. The swap renames a freshly
    /// created symlink over `current`, which replaces it in one step.
    pub fn set_current(&self, version: &str) -> Result<()> {
        let _held = self.lock();
        self.layout.ensure()?;

        let dir = self.layout.version_dir(version)?;
        if !dir.is_dir() {
            return Err(StoreError::VersionNotInstalled(version.to_string()));
        }
        let binary = dir.join(&self.binary_name);
        if !is_executable(&binary) {
            return Err(StoreError::BinaryMissing {
                version: version.to_string(),
                path: binary,
            });
        }

        let link = self.layout.current_link();
        let staged = self
            .layout
            .root()
            .join(format!(".current-{}.tmp", uuid::Uuid::new_v4().simple()));
        let target = Path::new(VERSIONS_DIR).join(version);

        make_dir_symlink(&target, &staged).map_err(|e| StoreError::from_write(&staged, e))?;
        if let Err(e) = std::fs::rename(&staged, &link) {
            let _ = std::fs::remove_file(&staged);
            return Err(StoreError::from_write(&link, e));
        }

        info!(version = %version, "current now points at version");
        Ok(())
    }

    /// Delete an installed version. Refuses the current one; absent is a no-op.
    pub fn remove(&self, version: &str) -> Result<()> {
        let _held = self.lock();
        self.layout.ensure()?;
        self.remove_unlocked(version)
    }

    fn remove_unlocked(&self, version: &str) -> Result<()> {
        let dir = self.layout.version_dir(version)?;
        if self.current_version().as_deref() == Some(version) {
            return Err(StoreError::CannotDeleteCurrentVersion(version.to_string()));
        }
        match std::fs::symlink_metadata(&dir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::from_io(&dir, e)),
            Ok(_) => {}
        }
        std::fs::remove_dir_all(&dir).map_err(|e| StoreError::from_write(&dir, e))?;
        info!(version = %version, "removed installed version");
        Ok(())
    }

    /// Every version directory holding an executable binary, newest first.
    ///
    /// Unreadable or corrupt metadata never fails the listing; the entry falls
    /// back to the directory timestamp with no checksum or arch.
    pub fn list_installed(&self) -> Result<Vec<InstalledVersion>> {
        self.layout.ensure()?;
        let current = self.current_version();
        let versions_dir = self.layout.versions_dir();

        let entries = std::fs::read_dir(&versions_dir)
            .map_err(|e| StoreError::from_io(&versions_dir, e))?;

        let mut installed = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable versions entry");
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_version(&name).is_err() {
                continue;
            }
            if let Some(found) = self.read_entry(&name, &entry.path(), current.as_deref()) {
                installed.push(found);
            }
        }

        sort_newest_first(&mut installed);
        Ok(installed)
    }

    /// A single installed version, if present with an executable binary.
    pub fn installed(&self, version: &str) -> Result<Option<InstalledVersion>> {
        let dir = self.layout.version_dir(version)?;
        let current = self.current_version();
        Ok(self.read_entry(version, &dir, current.as_deref()))
    }

    /// Keep the current version plus the newest others up to `keep` total
    /// (at least 1); delete the rest. Individual deletion failures are logged
    /// and reported, never fatal.
    pub fn prune(&self, keep: usize) -> Result<PruneReport> {
        let keep = keep.max(1);
        let _held = self.lock();

        let installed = self.list_installed()?;
        let current = self.current_version();

        let mut report = PruneReport::default();
        let mut budget = keep;
        if let Some(current) = &current {
            if installed.iter().any(|v| &v.version == current) {
                report.kept.push(current.clone());
                budget -= 1;
            }
        }

        let mut stale = Vec::new();
        for candidate in installed {
            if current.as_deref() == Some(candidate.version.as_str()) {
                continue;
            }
            if budget > 0 {
                report.kept.push(candidate.version);
                budget -= 1;
            } else {
                stale.push(candidate.version);
            }
        }

        for version in stale {
            match self.remove_unlocked(&version) {
                Ok(()) => report.removed.push(version),
                Err(e) => {
                    warn!(version = %version, error = %e, "failed to prune version");
                    report.failed.push(version);
                }
            }
        }

        debug!(
            kept = report.kept.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "prune finished"
        );
        Ok(report)
    }

    /// Move a fully prepared directory into `versions/<version>` with a single
    /// rename. `staged` must live on the same filesystem as the core root.
    pub fn adopt(&self, staged: &Path, version: &str) -> Result<InstalledVersion> {
        let _held = self.lock();
        self.layout.ensure()?;

        let dest = self.layout.version_dir(version)?;
        if std::fs::symlink_metadata(&dest).is_ok() {
            return Err(StoreError::VersionAlreadyInstalled(version.to_string()));
        }
        let binary = staged.join(&self.binary_name);
        if !is_executable(&binary) {
            return Err(StoreError::BinaryMissing {
                version: version.to_string(),
                path: binary,
            });
        }

        std::fs::rename(staged, &dest).map_err(|e| StoreError::from_write(&dest, e))?;
        info!(version = %version, "version installed");

        let current = self.current_version();
        self.read_entry(version, &dest, current.as_deref())
            .ok_or_else(|| StoreError::VersionNotInstalled(version.to_string()))
    }

    /// Stamp `validatedAt` in the version's metadata. Missing metadata is
    /// left alone.
    pub fn mark_validated(&self, version: &str) -> Result<()> {
        let _held = self.lock();
        let path = self.layout.metadata_file(version)?;
        let mut meta = match VersionMetadata::load(&path) {
            Ok(meta) => meta,
            Err(StoreError::FileMissing { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        meta.validated_at = Some(crate::timestamp::now());
        meta.save(&path)
    }

    fn read_entry(&self, version: &str, dir: &Path, current: Option<&str>) -> Option<InstalledVersion> {
        let dir_meta = std::fs::metadata(dir).ok()?;
        if !dir_meta.is_dir() {
            return None;
        }
        let executable = dir.join(&self.binary_name);
        if !is_executable(&executable) {
            return None;
        }

        let (installed_at, sha256, arch) = match VersionMetadata::load(&dir.join(METADATA_FILE)) {
            Ok(meta) => (meta.installed_at, Some(meta.binary.sha256), meta.binary.arch),
            Err(e) => {
                debug!(version = %version, error = %e, "metadata unavailable, using directory timestamp");
                let fallback = dir_meta
                    .created()
                    .or_else(|_| dir_meta.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
                (fallback, None, None)
            }
        };

        Some(InstalledVersion {
            version: version.to_string(),
            installed_at,
            executable,
            sha256,
            arch,
            is_current: current == Some(version),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Newest `installed_at` first; equal timestamps fall back to the version
/// string, descending.
fn sort_newest_first(installed: &mut [InstalledVersion]) {
    installed.sort_by(|a, b| {
        b.installed_at
            .cmp(&a.installed_at)
            .then_with(|| b.version.cmp(&a.version))
    });
}

/// Regular file with at least one execute bit.
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(unix)]
fn make_dir_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_dir_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
