//! Structured lifecycle events.
//!
//! Every event is an `info!` (or `warn!`) line carrying an `event` field so
//! log pipelines can filter on it:
//!
//! | event                  | emitted when                                  |
//! |------------------------|-----------------------------------------------|
//! | `lifecycle.transition` | the persisted lifecycle state changes         |
//! | `install.completed`    | a version lands under `versions/`             |
//! | `upgrade.promoted`     | `current` is repointed at a verified version  |
//! | `upgrade.rolled_back`  | `current` is reverted after a failed check    |
//! | `health.failed`        | a health check exhausts its retries           |
//! | `prune.completed`      | a retention pass finishes                     |

use corekeeper_store::{LifecycleState, PruneReport};
use tracing::{info, warn};

/// Span tagging everything logged inside an operation with the operation
/// name and version. Async code attaches it with `Instrument::instrument`.
pub fn operation_span(operation: &str, version: &str) -> tracing::Span {
    tracing::info_span!("corekeeper.op", operation = %operation, version = %version)
}

/// RAII guard entering [`operation_span`] for synchronous code.
///
/// ```ignore
/// let _span = OperationSpan::enter("prune", "-");
/// ```
pub struct OperationSpan {
    _span: tracing::span::EnteredSpan,
}

impl OperationSpan {
    pub fn enter(operation: &str, version: &str) -> Self {
        Self {
            _span: operation_span(operation, version).entered(),
        }
    }
}

pub fn emit_transition(from: &LifecycleState, to: &LifecycleState) {
    info!(
        event = "lifecycle.transition",
        from = from.name(),
        to = to.name(),
        detail = %to,
    );
}

pub fn emit_install_completed(version: &str, sha256: &str, asset: &str) {
    info!(event = "install.completed", version = %version, sha256 = %sha256, asset = %asset);
}

pub fn emit_promoted(version: &str, previous: Option<&str>) {
    info!(
        event = "upgrade.promoted",
        version = %version,
        previous = previous.unwrap_or("none"),
    );
}

pub fn emit_rolled_back(from: &str, to: Option<&str>, reason: &dyn std::fmt::Display) {
    warn!(
        event = "upgrade.rolled_back",
        from = %from,
        to = to.unwrap_or("none"),
        reason = %reason,
    );
}

pub fn emit_health_failed(version: &str, port: u16, consecutive: u32) {
    warn!(event = "health.failed", version = %version, port = port, consecutive = consecutive);
}

pub fn emit_prune_completed(report: &PruneReport) {
    info!(
        event = "prune.completed",
        kept = report.kept.len(),
        removed = report.removed.len(),
        failed = report.failed.len(),
    );
}
