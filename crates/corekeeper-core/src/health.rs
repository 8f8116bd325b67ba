//! Health probing of running core instances.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProbePolicy;
use crate::error::{CoreError, Result};

/// One health probe against a local instance.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `version` listening on `port` once.
    async fn check(&self, version: &str, port: u16) -> Result<()>;
}

/// `GET http://127.0.0.1:<port><path>`; any 2xx is healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(path: impl Into<String>, policy: &ProbePolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(policy.timeout())
            .no_proxy()
            .build()
            .map_err(|e| CoreError::Process(format!("health client: {e}")))?;
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Ok(Self { client, path })
    }

    pub fn url(&self, port: u16) -> String {
        format!("http://127.0.0.1:{port}{}", self.path)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, version: &str, port: u16) -> Result<()> {
        let fail = |message: String| CoreError::HealthCheckFailed {
            version: version.to_string(),
            port,
            message,
        };
        let response = self
            .client
            .get(self.url(port))
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(fail(format!("HTTP {status}")))
        }
    }
}

/// Probe until healthy or `policy.attempts` probes have failed. Exhausting
/// the attempts is a single `HealthCheckFailed`; cancellation interrupts
/// the wait between attempts.
pub async fn await_healthy(
    probe: &dyn HealthProbe,
    version: &str,
    port: u16,
    policy: &ProbePolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut last = String::from("no probe completed");

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled(format!("health check of {version}")));
        }
        match probe.check(version, port).await {
            Ok(()) => {
                debug!(version = %version, port, attempt, "health probe passed");
                return Ok(());
            }
            Err(e) => {
                debug!(version = %version, port, attempt, error = %e, "health probe failed");
                last = e.to_string();
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoreError::Cancelled(format!("health check of {version}")));
                }
                _ = tokio::time::sleep(policy.interval()) => {}
            }
        }
    }

    Err(CoreError::HealthCheckFailed {
        version: version.to_string(),
        port,
        message: format!("{attempts} probe(s) failed; last: {last}"),
    })
}
