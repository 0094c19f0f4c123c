//! Dispatcher persistence — one versioned JSON snapshot of the whole
//! registry, rewritten atomically on every mutation and read back once at
//! startup. Missing file means first run; a corrupt file must never prevent
//! startup.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use postpilot_core::{Result, SchedulerError};
use serde::{Deserialize, Serialize};

use crate::fsjson;
use crate::task::TaskSnapshot;

pub const SNAPSHOT_VERSION: u32 = 1;

/// The durable registry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u32,
    pub saved_at: NaiveDateTime,
    pub tasks: Vec<TaskSnapshot>,
    /// Mirror of the in-memory secondary index: account_id -> task_id.
    pub account_tasks: HashMap<String, String>,
}

/// Handle on the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Persist synchronously; atomic temp-then-rename.
    pub fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        fsjson::write_atomic(&self.path, snapshot)?;
        tracing::debug!(
            "💾 snapshot saved: {} tasks -> {}",
            snapshot.tasks.len(),
            self.path.display()
        );
        Ok(())
    }

    /// `Ok(None)` when the file does not exist yet; `CorruptSnapshot` when it
    /// exists but cannot be parsed (the caller downgrades that to a warning
    /// and starts empty).
    pub fn load(&self) -> Result<Option<RegistrySnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| SchedulerError::CorruptSnapshot(e.to_string()))?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&content)
            .map_err(|e| SchedulerError::CorruptSnapshot(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SchedulerError::CorruptSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }
}
