//! Error types for corekeeper-store

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, serialisable classification of every failure the lifecycle can
/// surface. Collaborators match on this rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    FileMissing,
    ParseError,
    WriteError,
    PermissionDenied,
    LockError,
    LockBusy,
    CannotDeleteCurrentVersion,
    ChecksumMismatch,
    UnsupportedPlatform,
    VersionNotInstalled,
    BinaryMissing,
    VersionAlreadyInstalled,
    InvalidVersion,
    IoError,
    Cancelled,
    NoMatchingAsset,
    DownloadFailed,
    ArchiveError,
    ProcessError,
    HealthCheckFailed,
    InvalidState,
}

impl ErrorKind {
    /// Wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FileMissing => "fileMissing",
            ErrorKind::ParseError => "parseError",
            ErrorKind::WriteError => "writeError",
            ErrorKind::PermissionDenied => "permissionDenied",
            ErrorKind::LockError => "lockError",
            ErrorKind::LockBusy => "lockBusy",
            ErrorKind::CannotDeleteCurrentVersion => "cannotDeleteCurrentVersion",
            ErrorKind::ChecksumMismatch => "checksumMismatch",
            ErrorKind::UnsupportedPlatform => "unsupportedPlatform",
            ErrorKind::VersionNotInstalled => "versionNotInstalled",
            ErrorKind::BinaryMissing => "binaryMissing",
            ErrorKind::VersionAlreadyInstalled => "versionAlreadyInstalled",
            ErrorKind::InvalidVersion => "invalidVersion",
            ErrorKind::IoError => "ioError",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NoMatchingAsset => "noMatchingAsset",
            ErrorKind::DownloadFailed => "downloadFailed",
            ErrorKind::ArchiveError => "archiveError",
            ErrorKind::ProcessError => "processError",
            ErrorKind::HealthCheckFailed => "healthCheckFailed",
            ErrorKind::InvalidState => "invalidState",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried by `LifecycleState::Error` and shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl From<&StoreError> for ErrorInfo {
    fn from(err: &StoreError) -> Self {
        ErrorInfo {
            kind: err.kind(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

/// Errors that can occur in the durable state layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Expected path is absent
    #[error("file missing: {}", path.display())]
    FileMissing { path: PathBuf },

    /// Malformed JSON in the state document or a metadata sidecar
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Durable write failed
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Lock file or binary not accessible
    #[error("permission denied: {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Lock could not be opened or taken for a reason other than contention
    #[error("lock '{name}' failed: {source}")]
    Lock {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Refused to delete the version `current` points at
    #[error("cannot delete current version {0}")]
    CannotDeleteCurrentVersion(String),

    /// Computed digest does not match the expected one
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// No directory for this version under `versions/`
    #[error("version not installed: {0}")]
    VersionNotInstalled(String),

    /// Version directory exists but holds no executable binary
    #[error("binary missing for version {version}: {}", path.display())]
    BinaryMissing { version: String, path: PathBuf },

    /// A directory for this version already exists
    #[error("version already installed: {0}")]
    VersionAlreadyInstalled(String),

    /// Version identifier is not safe to use as a directory name
    #[error("invalid version identifier: {0:?}")]
    InvalidVersion(String),

    /// Operation was cancelled before completing
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Any other I/O failure
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::FileMissing { .. } => ErrorKind::FileMissing,
            StoreError::Parse { .. } => ErrorKind::ParseError,
            StoreError::Write { .. } => ErrorKind::WriteError,
            StoreError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            StoreError::Lock { .. } => ErrorKind::LockError,
            StoreError::CannotDeleteCurrentVersion(_) => ErrorKind::CannotDeleteCurrentVersion,
            StoreError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            StoreError::VersionNotInstalled(_) => ErrorKind::VersionNotInstalled,
            StoreError::BinaryMissing { .. } => ErrorKind::BinaryMissing,
            StoreError::VersionAlreadyInstalled(_) => ErrorKind::VersionAlreadyInstalled,
            StoreError::InvalidVersion(_) => ErrorKind::InvalidVersion,
            StoreError::Cancelled(_) => ErrorKind::Cancelled,
            StoreError::Io { .. } => ErrorKind::IoError,
        }
    }

    /// Diagnostic details: offending path plus the OS error code when known.
    pub fn details(&self) -> Option<String> {
        let (path, source) = match self {
            StoreError::FileMissing { path } => (path, None),
            StoreError::Parse { path, .. } => (path, None),
            StoreError::Write { path, source }
            | StoreError::PermissionDenied { path, source }
            | StoreError::Lock { path, source, .. }
            | StoreError::Io { path, source } => (path, Some(source)),
            StoreError::ChecksumMismatch { path, .. } => (path, None),
            StoreError::BinaryMissing { path, .. } => (path, None),
            _ => return None,
        };
        let mut details = format!("path={}", path.display());
        if let Some(code) = source.and_then(|e| e.raw_os_error()) {
            details.push_str(&format!(" os_error={code}"));
        }
        Some(details)
    }

    /// Classify a read-side I/O error on `path`.
    pub fn from_io(path: &Path, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => StoreError::FileMissing {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                path: path.to_path_buf(),
                source,
            },
            _ => StoreError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    /// Classify a write-side I/O error on `path`.
    pub fn from_write(path: &Path, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                path: path.to_path_buf(),
                source,
            },
            _ => StoreError::Write {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
