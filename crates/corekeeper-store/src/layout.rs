//! On-disk layout of the core root directory.
//!
//! ```text
//! <core-root>/
//!   state.json
//!   current -> versions/<version>/
//!   releases/
//!   downloads/
//!   versions/<version>/<binary>, metadata.json
//!   locks/<name>.lock
//!   logs/
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, StoreError};

pub const STATE_FILE: &str = "state.json";
pub const CURRENT_LINK: &str = "current";
pub const RELEASES_DIR: &str = "releases";
pub const DOWNLOADS_DIR: &str = "downloads";
pub const VERSIONS_DIR: &str = "versions";
pub const LOCKS_DIR: &str = "locks";
pub const LOGS_DIR: &str = "logs";
pub const METADATA_FILE: &str = "metadata.json";

/// Path derivation for everything under the core root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreLayout {
    root: PathBuf,
}

impl CoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root and every managed subdirectory. Idempotent.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.releases_dir(),
            self.downloads_dir(),
            self.versions_dir(),
            self.locks_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::from_write(&dir, e))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn current_link(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join(RELEASES_DIR)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join(DOWNLOADS_DIR)
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// `versions/<version>`; the identifier must pass [`validate_version`].
    pub fn version_dir(&self, version: &str) -> Result<PathBuf> {
        validate_version(version)?;
        Ok(self.versions_dir().join(version))
    }

    pub fn metadata_file(&self, version: &str) -> Result<PathBuf> {
        Ok(self.version_dir(version)?.join(METADATA_FILE))
    }

    pub fn release_file(&self, version: &str) -> Result<PathBuf> {
        validate_version(version)?;
        Ok(self.releases_dir().join(format!("{version}.json")))
    }

    pub fn log_file(&self, version: &str) -> PathBuf {
        self.logs_dir().join(format!("{version}.log"))
    }
}

fn version_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[0-9A-Za-z][0-9A-Za-z._+-]*$").ok())
        .as_ref()
}

/// Reject identifiers that could escape `versions/` or collide with
/// store-internal entries.
pub fn validate_version(version: &str) -> Result<()> {
    let well_formed = version_pattern().is_some_and(|re| re.is_match(version));
    if version.len() > 128 || version.contains("..") || !well_formed {
        return Err(StoreError::InvalidVersion(version.to_string()));
    }
    Ok(())
}
