//! Per-task durable meta — one JSON file per task under its workspace,
//! mirroring cadence and identity plus the append-only step log. Survives the
//! process: a task can be rebuilt from snapshot defaults and continue where
//! its meta left off.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use postpilot_core::types::{AgentParams, SysType, TaskMode, TaskType};
use postpilot_core::Result;
use serde::{Deserialize, Serialize};

use crate::clock::HourWindow;
use crate::fsjson;

const META_FILE: &str = "meta.json";

/// One entry per `run_once` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub round: u64,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    /// "ok", "ended", or "error".
    pub outcome: String,
    /// Opaque per-step notes written by the agent side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<serde_json::Value>,
}

/// The durable meta document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    pub task_id: String,
    pub account_id: String,
    pub account_name: String,
    pub task_type: TaskType,
    pub sys_type: SysType,
    pub mode: TaskMode,
    #[serde(rename = "kwargs")]
    pub params: AgentParams,
    pub interval_secs: u32,
    pub valid_hours: Option<HourWindow>,
    pub end_date: NaiveDate,
    pub round_num: u64,
    #[serde(default)]
    pub login_status: Option<bool>,
    #[serde(default)]
    pub login_checked_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_updated: Option<NaiveDateTime>,
    /// Append-only; retention is left to integrators.
    #[serde(default, rename = "step")]
    pub steps: Vec<StepRecord>,
}

/// Handle on one task's meta file. Owned by the task record; all access is
/// serialized by the registry lock, so the file has a single writer.
#[derive(Debug)]
pub struct MetaStore {
    path: PathBuf,
    doc: TaskMeta,
}

impl MetaStore {
    /// Open the meta file in `dir`, or materialize `defaults` when it does
    /// not exist. A corrupt file is replaced by `defaults` with a warning —
    /// the snapshot remains the source of truth for identity and cadence.
    pub fn load_or_init(dir: &Path, defaults: TaskMeta) -> Result<Self> {
        let path = dir.join(META_FILE);
        if path.exists() {
            match fsjson::read::<TaskMeta>(&path) {
                Ok(doc) => return Ok(Self { path, doc }),
                Err(e) => {
                    tracing::warn!(
                        "⚠️ meta file for task '{}' unreadable ({e}), re-initializing",
                        defaults.task_id
                    );
                }
            }
        }
        let store = Self {
            path,
            doc: defaults,
        };
        store.persist()?;
        Ok(store)
    }

    pub fn doc(&self) -> &TaskMeta {
        &self.doc
    }

    /// Apply a mutation and persist. Every mutation saves.
    pub fn update(&mut self, f: impl FnOnce(&mut TaskMeta)) -> Result<()> {
        f(&mut self.doc);
        self.persist()
    }

    /// Push one step record and persist.
    pub fn append_step(&mut self, step: StepRecord) -> Result<()> {
        self.doc.round_num = self.doc.round_num.max(step.round);
        self.doc.steps.push(step);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        fsjson::write_atomic(&self.path, &self.doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use postpilot_core::types::{AgentParams, SysType, TaskMode, TaskType};

    fn defaults(dir_tag: &str) -> (PathBuf, TaskMeta) {
        let dir = std::env::temp_dir().join(format!("postpilot-test-meta-{dir_tag}"));
        std::fs::create_dir_all(&dir).ok();
        let meta = TaskMeta {
            task_id: "t-1".into(),
            account_id: "acc-1".into(),
            account_name: "Demo".into(),
            task_type: TaskType::SocialOperator,
            sys_type: SysType::MacIntel,
            mode: TaskMode::Standard,
            params: AgentParams::empty(TaskType::SocialOperator),
            interval_secs: 3600,
            valid_hours: None,
            end_date: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
            round_num: 0,
            login_status: None,
            login_checked_at: None,
            last_updated: None,
            steps: Vec::new(),
        };
        (dir, meta)
    }

    #[test]
    fn init_then_reload() {
        let (dir, meta) = defaults("reload");
        {
            let mut store = MetaStore::load_or_init(&dir, meta.clone()).unwrap();
            store
                .append_step(StepRecord {
                    round: 1,
                    started_at: NaiveDate::from_ymd_opt(2026, 3, 1)
                        .unwrap()
                        .and_hms_opt(10, 0, 0)
                        .unwrap(),
                    finished_at: NaiveDate::from_ymd_opt(2026, 3, 1)
                        .unwrap()
                        .and_hms_opt(10, 5, 0)
                        .unwrap(),
                    outcome: "ok".into(),
                    note: None,
                })
                .unwrap();
        }
        let store = MetaStore::load_or_init(&dir, meta).unwrap();
        assert_eq!(store.doc().round_num, 1);
        assert_eq!(store.doc().steps.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_file_reinitializes() {
        let (dir, meta) = defaults("corrupt");
        std::fs::write(dir.join(META_FILE), "not json {").unwrap();
        let store = MetaStore::load_or_init(&dir, meta).unwrap();
        assert_eq!(store.doc().round_num, 0);
        assert!(store.doc().steps.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
