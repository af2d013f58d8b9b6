//! Persistent record of backend outcomes
//!
//! A native accelerator crash takes the whole process down, so an attempt
//! is recorded before it starts. A marker still present at the next start means
//! that backend killed the previous process and must be skipped.

use super::candidate::ComputeBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const HISTORY_FILE: &str = "backend_state.json";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to read backend history {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write backend history {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse backend history {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct HistoryState {
    #[serde(default)]
    failed: BTreeSet<ComputeBackend>,
    #[serde(default)]
    attempting: Option<ComputeBackend>,
    #[serde(default)]
    last_success: Option<ComputeBackend>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Which accelerators have failed on this device, optionally persisted as JSON
#[derive(Debug, Clone, Default)]
pub struct BackendHistory {
    path: Option<PathBuf>,
    state: HistoryState,
}

impl BackendHistory {
    /// History that lives only as long as the process
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the history stored at `path`, recovering from an interrupted attempt.
    ///
    /// A missing file starts an empty history.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let shown = path.display().to_string();

        let mut state = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| HistoryError::Read {
                path: shown.clone(),
                source,
            })?;
            serde_json::from_str::<HistoryState>(&raw).map_err(|source| HistoryError::Parse {
                path: shown.clone(),
                source,
            })?
        } else {
            HistoryState::default()
        };

        let mut history_changed = false;
        if let Some(crashed) = state.attempting.take() {
            warn!(
                backend = %crashed,
                "Previous load attempt never finished, treating {} as failed", crashed
            );
            if crashed.is_accelerator() {
                state.failed.insert(crashed);
            }
            history_changed = true;
        }

        debug!(path = %shown, failed = ?state.failed, "Backend history opened");

        let history = Self {
            path: Some(path),
            state,
        };
        if history_changed {
            history.persist();
        }
        Ok(history)
    }

    /// Open `path`, or fall back to an in-memory history when it is unreadable
    pub fn open_or_in_memory(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::open(p).unwrap_or_else(|e| {
                warn!("{}. Backend history will not persist", e);
                Self::in_memory()
            }),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Backends that failed before and will be skipped
    pub fn failed(&self) -> &BTreeSet<ComputeBackend> {
        &self.state.failed
    }

    pub fn last_success(&self) -> Option<ComputeBackend> {
        self.state.last_success
    }

    pub fn attempting(&self) -> Option<ComputeBackend> {
        self.state.attempting
    }

    pub fn mark_attempting(&mut self, backend: ComputeBackend) {
        self.state.attempting = Some(backend);
        self.persist();
    }

    /// Record a failed attempt. CPU is the last resort and never recorded.
    pub fn mark_failed(&mut self, backend: ComputeBackend) {
        self.state.attempting = None;
        if backend.is_accelerator() {
            self.state.failed.insert(backend);
        }
        self.persist();
    }

    pub fn mark_succeeded(&mut self, backend: ComputeBackend) {
        self.state.attempting = None;
        self.state.last_success = Some(backend);
        self.persist();
    }

    /// Forget recorded failures so every accelerator is attempted again
    pub fn clear_failures(&mut self) {
        info!("Clearing backend failure history");
        self.state.failed.clear();
        self.state.attempting = None;
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.try_persist() {
            warn!("{}", e);
        }
    }

    fn try_persist(&self) -> Result<(), HistoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let shown = path.display().to_string();
        let write_err = |source| HistoryError::Write {
            path: shown.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut state = self.state.clone();
        state.updated_at = Some(Utc::now());
        let contents = serde_json::to_string_pretty(&state).map_err(|source| {
            HistoryError::Parse {
                path: shown.clone(),
                source,
            }
        })?;
        std::fs::write(path, contents).map_err(write_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_records_failures() {
        let mut history = BackendHistory::in_memory();
        history.mark_failed(ComputeBackend::OpenCl);
        history.mark_failed(ComputeBackend::Cpu);
        assert!(history.failed().contains(&ComputeBackend::OpenCl));
        assert!(!history.failed().contains(&ComputeBackend::Cpu));
        assert!(history.path().is_none());
    }

    #[test]
    fn test_failures_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(HISTORY_FILE);

        let mut history = BackendHistory::open(&path).unwrap();
        history.mark_failed(ComputeBackend::Vulkan);
        history.mark_succeeded(ComputeBackend::OpenCl);

        let reopened = BackendHistory::open(&path).unwrap();
        assert!(reopened.failed().contains(&ComputeBackend::Vulkan));
        assert_eq!(reopened.last_success(), Some(ComputeBackend::OpenCl));
    }

    #[test]
    fn test_interrupted_attempt_marks_backend_failed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(HISTORY_FILE);

        let mut history = BackendHistory::open(&path).unwrap();
        history.mark_attempting(ComputeBackend::OpenCl);
        // process dies here
        drop(history);

        let recovered = BackendHistory::open(&path).unwrap();
        assert!(recovered.failed().contains(&ComputeBackend::OpenCl));
        assert_eq!(recovered.attempting(), None);
    }

    #[test]
    fn test_clear_failures() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(HISTORY_FILE);
        let mut history = BackendHistory::open(&path).unwrap();
        history.mark_failed(ComputeBackend::OpenCl);
        history.clear_failures();

        assert!(BackendHistory::open(&path).unwrap().failed().is_empty());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(HISTORY_FILE);
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            BackendHistory::open(&path),
            Err(HistoryError::Parse { .. })
        ));
        let history = BackendHistory::open_or_in_memory(Some(&path));
        assert!(history.path().is_none());
    }
}
