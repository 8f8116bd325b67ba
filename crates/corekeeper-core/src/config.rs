//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::feed::DEFAULT_API_BASE;

pub const DEFAULT_BINARY_NAME: &str = "core";
pub const DEFAULT_PORT: u16 = 8317;
pub const DEFAULT_TESTING_PORT: u16 = 8318;
pub const DEFAULT_HEALTH_PATH: &str = "/healthz";
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Retry policy for health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbePolicy {
    /// Probes per check before the check counts as failed.
    pub attempts: u32,
    pub interval_ms: u64,
    /// Per-probe request timeout.
    pub timeout_ms: u64,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval_ms: 500,
            timeout_ms: 2_000,
        }
    }
}

impl ProbePolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    /// Core root holding `state.json`, `versions/`, `locks/` and friends.
    pub root: PathBuf,
    /// File name of the installed executable inside each version directory.
    pub binary_name: String,
    /// Other names the executable may carry inside a release archive.
    pub archive_binary_names: Vec<String>,
    pub port: u16,
    /// Port the canary instance listens on.
    pub testing_port: u16,
    /// Arguments passed to the core process; `{port}` is substituted.
    pub launch_args: Vec<String>,
    pub health_path: String,
    pub probe: ProbePolicy,
    pub lock_poll_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub keep_versions: usize,
    /// Consecutive failed health checks that trigger automatic rollback.
    pub failure_threshold: u32,
    /// `owner/name` of the repository publishing releases.
    pub release_repo: Option<String>,
    pub api_base: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            root: std::env::var("COREKEEPER_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_root()),
            binary_name: std::env::var("COREKEEPER_BINARY")
                .unwrap_or_else(|_| DEFAULT_BINARY_NAME.to_string()),
            archive_binary_names: vec!["cli-proxy-api".to_string()],
            port: env_parse("COREKEEPER_PORT").unwrap_or(DEFAULT_PORT),
            testing_port: env_parse("COREKEEPER_TESTING_PORT").unwrap_or(DEFAULT_TESTING_PORT),
            launch_args: vec!["--port".to_string(), "{port}".to_string()],
            health_path: std::env::var("COREKEEPER_HEALTH_PATH")
                .unwrap_or_else(|_| DEFAULT_HEALTH_PATH.to_string()),
            probe: ProbePolicy::default(),
            lock_poll_interval_ms: 250,
            stop_grace_ms: 5_000,
            keep_versions: env_parse("COREKEEPER_KEEP_VERSIONS")
                .unwrap_or(corekeeper_store::DEFAULT_KEEP),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            release_repo: std::env::var("COREKEEPER_RELEASE_REPO").ok(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

fn default_root() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".corekeeper"))
        .unwrap_or_else(|_| PathBuf::from(".corekeeper"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl CoreConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    pub fn with_ports(mut self, port: u16, testing_port: u16) -> Self {
        self.port = port;
        self.testing_port = testing_port;
        self
    }

    pub fn with_probe(mut self, probe: ProbePolicy) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_keep_versions(mut self, keep: usize) -> Self {
        self.keep_versions = keep;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_release_repo(mut self, repo: impl Into<String>) -> Self {
        self.release_repo = Some(repo.into());
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Names the executable is searched under inside an unpacked archive,
    /// final name first.
    pub fn binary_candidates(&self) -> Vec<String> {
        let mut names = vec![self.binary_name.clone()];
        for name in &self.archive_binary_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}
