//! Error types for corekeeper-core

use std::path::PathBuf;

use corekeeper_store::{ErrorInfo, ErrorKind, StoreError};
use thiserror::Error;

/// Errors raised by the lifecycle logic
#[derive(Error, Debug)]
pub enum CoreError {
    /// Durable-state failure (hashing, locks, versions, state document)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Host architecture or OS has no release flavour
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Release carries no archive for this host
    #[error("release {tag} has no asset for {platform}")]
    NoMatchingAsset { tag: String, platform: String },

    /// Release feed or asset download failed
    #[error("download from {url} failed: {message}")]
    Download { url: String, message: String },

    /// Archive could not be unpacked
    #[error("failed to unpack {}: {message}", path.display())]
    Archive { path: PathBuf, message: String },

    /// Launching, signalling or reaping the core process failed
    #[error("process error: {0}")]
    Process(String),

    /// Health probe did not succeed within its retry budget
    #[error("health check failed for {version} on port {port}: {message}")]
    HealthCheckFailed {
        version: String,
        port: u16,
        message: String,
    },

    /// Named lock is held by another caller
    #[error("lock '{0}' is held by another operation")]
    LockBusy(String),

    /// Operation not valid from the current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Caller cancelled the operation
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Background task panicked or was aborted
    #[error("background task failed: {0}")]
    Task(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Store(e) => e.kind(),
            CoreError::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            CoreError::NoMatchingAsset { .. } => ErrorKind::NoMatchingAsset,
            CoreError::Download { .. } => ErrorKind::DownloadFailed,
            CoreError::Archive { .. } => ErrorKind::ArchiveError,
            CoreError::Process(_) => ErrorKind::ProcessError,
            CoreError::HealthCheckFailed { .. } => ErrorKind::HealthCheckFailed,
            CoreError::LockBusy(_) => ErrorKind::LockBusy,
            CoreError::InvalidState(_) => ErrorKind::InvalidState,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
            CoreError::Task(_) => ErrorKind::IoError,
        }
    }

    pub fn details(&self) -> Option<String> {
        match self {
            CoreError::Store(e) => e.details(),
            CoreError::Download { url, .. } => Some(format!("url={url}")),
            CoreError::Archive { path, .. } => Some(format!("path={}", path.display())),
            _ => None,
        }
    }

    /// True when the operation was interrupted rather than failed.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<&CoreError> for ErrorInfo {
    fn from(err: &CoreError) -> Self {
        ErrorInfo {
            kind: err.kind(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        CoreError::Task(err.to_string())
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
