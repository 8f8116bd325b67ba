//! Corekeeper Core Library
//!
//! Lifecycle logic for the managed core process: picking a release for this
//! host, installing it side by side, canarying it on a testing port,
//! promoting it, and rolling back when it fails its health checks.
//!
//! ## Layer 1 - Lifecycle
//!
//! Builds on `corekeeper-store` for everything durable. The network and the
//! process table are reached only through the `ReleaseFeed`, `AssetFetcher`,
//! `ProcessLauncher` and `HealthProbe` traits; `fakes` implements all four
//! in memory.

pub mod arch;
pub mod archive;
pub mod config;
pub mod error;
pub mod fakes;
pub mod feed;
pub mod fetch;
pub mod health;
pub mod install;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod process;
pub mod release;
pub mod telemetry;

pub use arch::{BinaryFormat, HostArch, HostPlatform, OsToken, SniffedBinary};
pub use config::{CoreConfig, ProbePolicy};
pub use error::{CoreError, Result};
pub use feed::{GithubReleaseFeed, ReleaseFeed};
pub use fetch::{AssetFetcher, HttpAssetFetcher};
pub use health::{await_healthy, HealthProbe, HttpHealthProbe};
pub use install::{InstallOutcome, InstallPhase, Installer};
pub use orchestrator::{Components, HealthStatus, Orchestrator, RollbackReport, UpgradeOutcome};
pub use process::{CommandLauncher, LaunchedProcess, ProcessLauncher};
pub use release::{select_asset, ArchiveKind, Asset, Release};

pub use corekeeper_store::{
    CoreLayout, ErrorInfo, ErrorKind, InstalledVersion, LifecycleState, LockName,
    PersistedCoreState, PruneReport, StoreError, VersionStore,
};
