//! Durable storage for [`PodState`].
//!
//! A save either replaces the whole record or leaves the previous one in
//! place. The orchestrator relies on that to keep memory and disk agreeing.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use dashpod_core::PodState;
use tracing::debug;

/// Errors from a [`PodStateStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Where the pod state lives between runs.
pub trait PodStateStore: Send + Sync {
    /// The last saved record, or `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<PodState>, StoreError>;

    /// Replace the saved record.
    fn save(&self, state: &PodState) -> Result<(), StoreError>;
}

/// JSON file store with atomic replace.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PodStateStore for JsonFileStore {
    fn load(&self) -> Result<Option<PodState>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn save(&self, state: &PodState) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_vec_pretty(state)?;
        // NamedTempFile is created owner-only (0600) on Unix.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        debug!(path = %self.path.display(), progress = %state.setup_progress, "Pod state saved");
        Ok(())
    }
}

/// In-memory store for embedders without a filesystem, and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<PodState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PodState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }

    /// The last saved record.
    pub fn snapshot(&self) -> Option<PodState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PodStateStore for MemoryStore {
    fn load(&self) -> Result<Option<PodState>, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &PodState) -> Result<(), StoreError> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        Ok(())
    }
}
