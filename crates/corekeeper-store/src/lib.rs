//! Corekeeper-Store: durable on-disk state for Corekeeper
//!
//! Everything the lifecycle controller must remember across restarts lives
//! under a single core root directory and is owned by this crate.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: crash safety. Every mutation is either a same-directory rename or
//! an advisory lock acquisition, so a process killed at any point leaves a
//! consistent tree behind.
//!
//! ## Key Components
//!
//! - `VersionStore`: side-by-side installed versions and the `current` symlink
//! - `StateStore`: the `state.json` lifecycle document
//! - `LockManager`: cross-process advisory locks under `locks/`
//! - `hasher`: streaming SHA-256 of files

pub mod error;
pub mod hasher;
pub mod layout;
pub mod lock;
pub mod metadata;
pub mod persist;
pub mod state;
pub mod state_store;
pub mod timestamp;
pub mod version_store;

pub use error::{ErrorInfo, ErrorKind, Result, StoreError};
pub use layout::{validate_version, CoreLayout};
pub use lock::{LockGuard, LockManager, LockName};
pub use metadata::{BinaryInfo, SourceInfo, VersionMetadata};
pub use state::{attempt_result, LifecycleState, PersistedCoreState, UpgradeAttempt};
pub use state_store::StateStore;
pub use version_store::{InstalledVersion, PruneReport, VersionStore, DEFAULT_KEEP};
