//! Durable store for the `state.json` lifecycle document.
//!
//! Reads never silently reset: a corrupt document is a `ParseError`, because
//! quietly starting from defaults could hide a pending rollback. Writes go
//! through [`persist::write_atomic`]. Read-modify-write cycles are serialized
//! within the process by an internal async mutex; cross-process exclusion is
//! the lock manager's job.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::persist;
use crate::state::PersistedCoreState;

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    gate: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document, or the default one if none was ever written.
    pub async fn read(&self) -> Result<PersistedCoreState> {
        let _held = self.gate.lock().await;
        self.read_unlocked()
    }

    /// Replace the document atomically.
    pub async fn write(&self, state: &PersistedCoreState) -> Result<()> {
        let _held = self.gate.lock().await;
        self.write_unlocked(state)
    }

    /// Apply `mutator` to the current document and persist the result as one
    /// unit. Concurrent callers in this process are applied one after another.
    /// Returns the document as written.
    pub async fn update<F>(&self, mutator: F) -> Result<PersistedCoreState>
    where
        F: FnOnce(&mut PersistedCoreState),
    {
        let _held = self.gate.lock().await;
        let mut state = self.read_unlocked()?;
        mutator(&mut state);
        self.write_unlocked(&state)?;
        Ok(state)
    }

    fn read_unlocked(&self) -> Result<PersistedCoreState> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedCoreState::default());
            }
            Err(e) => return Err(StoreError::from_io(&self.path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write_unlocked(&self, state: &PersistedCoreState) -> Result<()> {
        let mut state = state.clone();
        state.updated_at = Some(crate::timestamp::now());
        persist::write_json_atomic(&self.path, &state)?;
        debug!(lifecycle = state.lifecycle.name(), "state document written");
        Ok(())
    }
}
