//! Named, file-backed advisory locks.
//!
//! One lock file per name under `locks/`. An exclusive `flock`-style lock on
//! that file is the host-wide guarantee that at most one install or upgrade
//! workflow runs at a time, across every process that honours it.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use fs2::FileExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Lower bound for the poll interval of [`LockManager::acquire`].
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The locks the lifecycle knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    Install,
    Upgrade,
}

impl LockName {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockName::Install => "install",
            LockName::Upgrade => "upgrade",
        }
    }
}

impl std::fmt::Display for LockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(LockName::Install),
            "upgrade" => Ok(LockName::Upgrade),
            other => Err(format!("unknown lock name: {other}")),
        }
    }
}

/// Hands out [`LockGuard`]s for the lock files in one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn lock_path(&self, name: LockName) -> PathBuf {
        self.dir.join(format!("{}.lock", name.as_str()))
    }

    /// Attempt a non-blocking exclusive lock.
    ///
    /// `Ok(None)` means another holder has it; that is contention, not an
    /// error. Any other failure to open or lock the file is fatal.
    pub fn try_acquire(&self, name: LockName) -> Result<Option<LockGuard>> {
        let path = self.lock_path(name);
        std::fs::create_dir_all(&self.dir).map_err(|source| lock_err(name, &self.dir, source))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| lock_err(name, &path, source))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                // Owner pid is diagnostic only.
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                debug!(lock = %name, path = ?path, "acquired advisory lock");
                Ok(Some(LockGuard {
                    name,
                    path,
                    file: Some(file),
                }))
            }
            Err(e) if is_contended(&e) => {
                debug!(lock = %name, "advisory lock is held elsewhere");
                Ok(None)
            }
            Err(source) => Err(lock_err(name, &path, source)),
        }
    }

    /// Poll [`try_acquire`](Self::try_acquire) until it succeeds.
    ///
    /// Cancellation is checked before every attempt and interrupts the sleep
    /// between attempts; a cancelled wait returns `Cancelled` and holds nothing.
    pub async fn acquire(
        &self,
        name: LockName,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockGuard> {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled(format!("waiting for lock '{name}'")));
            }
            if let Some(guard) = self.try_acquire(name)? {
                return Ok(guard);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(StoreError::Cancelled(format!("waiting for lock '{name}'")));
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Run `f` while holding `name`. The lock is released as soon as `f`
    /// completes, before this function returns.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: LockName,
        poll_interval: Duration,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut guard = self.acquire(name, poll_interval, cancel).await?;
        let out = f().await;
        guard.unlock();
        Ok(out)
    }
}

/// A held advisory lock. Released by [`unlock`](Self::unlock) or on drop.
#[derive(Debug)]
pub struct LockGuard {
    name: LockName,
    path: PathBuf,
    file: Option<File>,
}

impl LockGuard {
    pub fn name(&self) -> LockName {
        self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Safe to call any number of times.
    pub fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                // Closing the descriptor below releases it regardless.
                warn!(lock = %self.name, error = %e, "explicit unlock failed");
            }
            drop(file);
            debug!(lock = %self.name, "released advisory lock");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || (e.raw_os_error().is_some()
            && e.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}

fn lock_err(name: LockName, path: &Path, source: std::io::Error) -> StoreError {
    if source.kind() == std::io::ErrorKind::PermissionDenied {
        StoreError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        }
    } else {
        StoreError::Lock {
            name: name.as_str().to_string(),
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_second_try_acquire_is_not_acquired() {
        let dir = tempdir().unwrap();
        let a = LockManager::new(dir.path());
        let b = LockManager::new(dir.path());

        let held = a.try_acquire(LockName::Upgrade).unwrap();
        assert!(held.is_some());
        assert!(b.try_acquire(LockName::Upgrade).unwrap().is_none());

        drop(held);
        assert!(b.try_acquire(LockName::Upgrade).unwrap().is_some());
    }

    #[test]
    fn test_names_are_independent() {
        let dir = tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let _install = locks.try_acquire(LockName::Install).unwrap().unwrap();
        assert!(locks.try_acquire(LockName::Upgrade).unwrap().is_some());
    }

    #[test]
    fn test_unlock_is_idempotent_and_synchronous() {
        let dir = tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let mut guard = locks.try_acquire(LockName::Install).unwrap().unwrap();
        assert!(guard.is_held());

        guard.unlock();
        assert!(!guard.is_held());
        assert!(locks.try_acquire(LockName::Install).unwrap().is_some());

        guard.unlock();
        drop(guard);
    }

    #[test]
    fn test_lock_file_records_pid() {
        let dir = tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let guard = locks.try_acquire(LockName::Install).unwrap().unwrap();
        let content = std::fs::read_to_string(guard.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_lock_paths_live_in_layout_locks_dir() {
        let layout = crate::CoreLayout::new("/data/core");
        let locks = LockManager::new(layout.locks_dir());
        assert_eq!(
            locks.lock_path(LockName::Upgrade),
            PathBuf::from("/data/core/locks/upgrade.lock")
        );
        assert_eq!(
            locks.lock_path(LockName::Install),
            PathBuf::from("/data/core/locks/install.lock")
        );
    }

    #[test]
    fn test_lock_name_parse() {
        assert_eq!("install".parse::<LockName>().unwrap(), LockName::Install);
        assert_eq!("upgrade".parse::<LockName>().unwrap(), LockName::Upgrade);
        assert!("other".parse::<LockName>().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_try_acquire_exactly_one_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                let guard = LockManager::new(path)
                    .try_acquire(LockName::Upgrade)
                    .expect("try_acquire must not error on contention");
                // Hold long enough for the sibling to observe contention.
                tokio::time::sleep(Duration::from_millis(100)).await;
                guard.is_some()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let dir = tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let held = locks.try_acquire(LockName::Upgrade).unwrap().unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(held);
        });

        let cancel = CancellationToken::new();
        let guard = tokio::time::timeout(
            Duration::from_secs(5),
            locks.acquire(LockName::Upgrade, Duration::from_millis(10), &cancel),
        )
        .await
        .expect("acquire should finish once released")
        .unwrap();
        assert!(guard.is_held());
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_cancelled_while_waiting() {
        let dir = tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let _held = locks.try_acquire(LockName::Upgrade).unwrap().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            locks.acquire(LockName::Upgrade, Duration::from_secs(60), &cancel),
        )
        .await
        .expect("cancellation must interrupt the poll sleep")
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_pre_cancelled_acquire_never_locks() {
        let dir = tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = locks
            .acquire(LockName::Install, Duration::from_millis(10), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(locks.try_acquire(LockName::Install).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_with_lock_releases_when_scope_ends() {
        let dir = tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let cancel = CancellationToken::new();

        let inner = locks.clone();
        let observed_busy = locks
            .with_lock(
                LockName::Install,
                Duration::from_millis(10),
                &cancel,
                || async move { inner.try_acquire(LockName::Install).unwrap().is_none() },
            )
            .await
            .unwrap();
        assert!(observed_busy);
        assert!(locks.try_acquire(LockName::Install).unwrap().is_some());
    }

    #[test]
    fn test_unwritable_dir_is_fatal() {
        let dir = tempdir().unwrap();
        let file_in_the_way = dir.path().join("locks");
        std::fs::write(&file_in_the_way, b"").unwrap();

        let locks = LockManager::new(&file_in_the_way);
        let err = locks.try_acquire(LockName::Install).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::LockError | ErrorKind::PermissionDenied
        ));
    }
}
