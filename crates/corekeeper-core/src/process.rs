//! Launching and stopping core process instances.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Child;
use tracing::{debug, info, warn};

use corekeeper_store::StoreError;

use crate::error::{CoreError, Result};

const LIVENESS_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchedProcess {
    pub pid: u32,
}

/// Starts, stops and inspects core process instances.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start `executable` (installed as `version`) listening on `port`.
    async fn launch(&self, executable: &Path, version: &str, port: u16) -> Result<LaunchedProcess>;

    /// Stop `pid`, escalating to a hard kill after the grace period.
    /// Stopping a process that is already gone succeeds.
    async fn stop(&self, pid: u32) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Runs the core binary as a child process. Output of each version is
/// appended to `logs/<version>.log`.
pub struct CommandLauncher {
    logs_dir: PathBuf,
    args: Vec<String>,
    grace: Duration,
    children: Mutex<HashMap<u32, Child>>,
}

impl CommandLauncher {
    /// `args` may contain `{port}`, replaced at launch.
    pub fn new(logs_dir: impl Into<PathBuf>, args: Vec<String>, grace: Duration) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            args,
            grace,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn children(&self) -> MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_log(&self, version: &str) -> Result<(std::fs::File, std::fs::File)> {
        std::fs::create_dir_all(&self.logs_dir)
            .map_err(|e| StoreError::from_write(&self.logs_dir, e))?;
        let path = self.logs_dir.join(format!("{version}.log"));
        let out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::from_write(&path, e))?;
        let err = out.try_clone().map_err(|e| StoreError::from_write(&path, e))?;
        Ok((out, err))
    }

    async fn wait_gone(&self, pid: u32, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while pid_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(LIVENESS_POLL).await;
        }
        true
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, executable: &Path, version: &str, port: u16) -> Result<LaunchedProcess> {
        let (stdout, stderr) = self.open_log(version)?;
        let port_str = port.to_string();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{port}", &port_str))
            .collect();

        let mut command = tokio::process::Command::new(executable);
        command
            .args(&args)
            .env("COREKEEPER_PORT", &port_str)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            CoreError::Process(format!("failed to launch {}: {e}", executable.display()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| CoreError::Process(format!("{version} exited before reporting a pid")))?;
        self.children().insert(pid, child);

        info!(version = %version, pid, port, "core process launched");
        Ok(LaunchedProcess { pid })
    }

    async fn stop(&self, pid: u32) -> Result<()> {
        let child = self.children().remove(&pid);

        if !send_signal(pid, Termination::Graceful)? {
            debug!(pid, "process already gone");
            if let Some(mut child) = child {
                let _ = child.wait().await;
            }
            return Ok(());
        }

        match child {
            Some(mut child) => match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(pid, "grace period elapsed, killing");
                    child
                        .kill()
                        .await
                        .map_err(|e| CoreError::Process(format!("failed to kill {pid}: {e}")))?;
                }
            },
            None => {
                if !self.wait_gone(pid, self.grace).await {
                    warn!(pid, "grace period elapsed, killing");
                    send_signal(pid, Termination::Forced)?;
                    if !self.wait_gone(pid, self.grace).await {
                        return Err(CoreError::Process(format!("pid {pid} survived SIGKILL")));
                    }
                }
            }
        }
        info!(pid, "core process stopped");
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut children = self.children();
        let Some(child) = children.get_mut(&pid) else {
            drop(children);
            return pid_alive(pid);
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid, %status, "core process exited, reaped");
                children.remove(&pid);
                false
            }
            Err(e) => {
                warn!(pid, error = %e, "failed to poll child");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

/// Returns `false` when the process no longer exists.
#[cfg(unix)]
fn send_signal(pid: u32, how: Termination) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = checked_pid(pid) else {
        return Ok(false);
    };
    let signal = match how {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(CoreError::Process(format!("kill({pid}, {signal:?}) failed: {e}"))),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _how: Termination) -> Result<bool> {
    Err(CoreError::Process(format!(
        "signalling pid {pid} is not supported on this platform"
    )))
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(raw) = checked_pid(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Pids 0 and out-of-range values address process groups, never a process.
#[cfg(unix)]
fn checked_pid(pid: u32) -> Option<i32> {
    i32::try_from(pid).ok().filter(|p| *p > 0)
}
