//! Per-version `metadata.json` sidecar.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::persist;

pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Where an installed version came from, as fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    /// Origin repository, `owner/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Raw release tag, e.g. `v6.6.103-0`.
    pub tag: String,
    pub asset_name: String,
    pub asset_url: String,
    /// Archive digest as computed at download time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_sha256: Option<String>,
}

/// The installed executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryInfo {
    /// File name inside the archive, when it differs from `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_name: Option<String>,
    /// Final file name inside the version directory.
    pub name: String,
    /// Digest of the installed file. Must match the file on disk.
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    pub schema_version: u32,
    pub version: String,
    #[serde(with = "crate::timestamp")]
    pub installed_at: DateTime<Utc>,
    #[serde(default, with = "crate::timestamp::option", skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,
    pub source: SourceInfo,
    pub binary: BinaryInfo,
}

impl VersionMetadata {
    pub fn new(version: impl Into<String>, source: SourceInfo, binary: BinaryInfo) -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            version: version.into(),
            installed_at: crate::timestamp::now(),
            validated_at: None,
            source,
            binary,
        }
    }

    /// Decode a sidecar file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| StoreError::from_io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the sidecar atomically with sorted keys.
    pub fn save(&self, path: &Path) -> Result<()> {
        persist::write_json_atomic(path, self)
    }
}
