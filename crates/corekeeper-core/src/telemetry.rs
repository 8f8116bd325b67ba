//! Tracing setup for the `corekeeper` and `corekeeperd` binaries.
//!
//! When `RUST_LOG` is unset only corekeeper's own targets log at the
//! requested level. Dependencies such as `reqwest` stay at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log targets owned by this workspace.
pub const CRATE_TARGETS: &[&str] = &[
    "corekeeper_core",
    "corekeeper_store",
    "corekeeper",
    "corekeeperd",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact lines for a terminal.
    Text,
    /// One JSON object per line. Fields of the enclosing operation span
    /// (`operation`, `version`, ...) are attached to every event.
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    CRATE_TARGETS
        .iter()
        .fold(String::from("warn"), |mut acc, target| {
            acc.push(',');
            acc.push_str(target);
            acc.push('=');
            acc.push_str(&level);
            acc
        })
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber, writing to stderr so stdout stays free
/// for command output. Only the first call in a process takes effect.
pub fn init_tracing(format: LogFormat, level: Level) {
    let registry = tracing_subscriber::registry().with(env_filter(level));
    let installed = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    installed.ok();
}
