//! Lifecycle state machine and the persisted core-state document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// The single global lifecycle of the managed core process.
///
/// Encoded as one `"state"` discriminant plus the payload of that case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LifecycleState {
    /// No core process managed, nothing in flight.
    #[default]
    Idle,
    /// Launch requested, not yet confirmed running.
    Starting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_version: Option<String>,
        port: u16,
    },
    /// Confirmed live on the production port.
    Running {
        active_version: String,
        pid: u32,
        port: u16,
        #[serde(with = "crate::timestamp")]
        started_at: DateTime<Utc>,
    },
    /// Shutdown requested, not yet confirmed dead.
    Stopping,
    /// A new version is being fetched, unpacked or verified.
    Installing {
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    /// Canary instance of a freshly installed version on the testing port.
    Testing {
        version: String,
        pid: u32,
        port: u16,
        #[serde(with = "crate::timestamp")]
        started_at: DateTime<Utc>,
    },
    /// Canary passed; `current` is being swapped.
    Promoting { version: String },
    /// A health check failed; `current` is being reverted to `to`.
    RollingBack {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    /// This attempt failed. Recoverable via an explicit reset.
    Error(ErrorInfo),
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting { .. } => "starting",
            LifecycleState::Running { .. } => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Installing { .. } => "installing",
            LifecycleState::Testing { .. } => "testing",
            LifecycleState::Promoting { .. } => "promoting",
            LifecycleState::RollingBack { .. } => "rollingBack",
            LifecycleState::Error(_) => "error",
        }
    }

    /// States that only exist while an operation is in flight. Finding one
    /// on disk at boot means the previous owner died mid-operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LifecycleState::Starting { .. }
                | LifecycleState::Stopping
                | LifecycleState::Installing { .. }
                | LifecycleState::Testing { .. }
                | LifecycleState::Promoting { .. }
                | LifecycleState::RollingBack { .. }
        )
    }

    /// Process id of the instance this state refers to, if any.
    pub fn pid(&self) -> Option<u32> {
        match self {
            LifecycleState::Running { pid, .. } | LifecycleState::Testing { pid, .. } => {
                Some(*pid)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Starting {
                target_version,
                port,
            } => write!(
                f,
                "starting {} on :{port}",
                target_version.as_deref().unwrap_or("current")
            ),
            LifecycleState::Running {
                active_version,
                pid,
                port,
                ..
            } => write!(f, "running {active_version} (pid {pid}) on :{port}"),
            LifecycleState::Installing { version, phase } => match phase {
                Some(phase) => write!(f, "installing {version} ({phase})"),
                None => write!(f, "installing {version}"),
            },
            LifecycleState::Testing {
                version, pid, port, ..
            } => write!(f, "testing {version} (pid {pid}) on :{port}"),
            LifecycleState::Promoting { version } => write!(f, "promoting {version}"),
            LifecycleState::RollingBack { from, to } => write!(
                f,
                "rolling back {from} -> {}",
                to.as_deref().unwrap_or("none")
            ),
            LifecycleState::Error(info) => write!(f, "error [{}] {}", info.kind, info.message),
            other => f.write_str(other.name()),
        }
    }
}

/// Result labels recorded on [`UpgradeAttempt::result`].
pub mod attempt_result {
    pub const PROMOTED: &str = "promoted";
    pub const ROLLED_BACK: &str = "rolledBack";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
    pub const INTERRUPTED: &str = "interrupted";
}

/// Outcome of the most recent upgrade attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeAttempt {
    pub version: String,
    #[serde(with = "crate::timestamp")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "crate::timestamp::option", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl UpgradeAttempt {
    pub fn begin(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            started_at: crate::timestamp::now(),
            finished_at: None,
            result: None,
            error_code: None,
        }
    }

    pub fn finish(&mut self, result: &str, error_code: Option<&str>) {
        self.finished_at = Some(crate::timestamp::now());
        self.result = Some(result.to_string());
        self.error_code = error_code.map(str::to_string);
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

/// The durable `state.json` document; single source of truth across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCoreState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_good_version: Option<String>,
    #[serde(default)]
    pub consecutive_health_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upgrade_attempt: Option<UpgradeAttempt>,
    #[serde(default)]
    pub lifecycle: LifecycleState,
    #[serde(default, with = "crate::timestamp::option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PersistedCoreState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            active_version: None,
            last_known_good_version: None,
            consecutive_health_failures: 0,
            last_upgrade_attempt: None,
            lifecycle: LifecycleState::Idle,
            updated_at: None,
        }
    }
}

impl PersistedCoreState {
    pub fn record_health_success(&mut self) {
        self.consecutive_health_failures = 0;
    }

    /// Returns the new consecutive failure count.
    pub fn record_health_failure(&mut self) -> u32 {
        self.consecutive_health_failures = self.consecutive_health_failures.saturating_add(1);
        self.consecutive_health_failures
    }
}
