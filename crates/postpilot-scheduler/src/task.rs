//! Task state — the in-memory record the registry owns, and the plain-data
//! snapshot every control-plane operation returns.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use postpilot_agent::{LoginProbe, OperatorAgent};
use postpilot_core::types::{AgentParams, SysType, TaskMode, TaskType};
use serde::{Deserialize, Serialize};

use crate::clock::HourWindow;
use crate::meta::MetaStore;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for its next execution time.
    Pending,
    /// A run is in flight. At most one task holds this status.
    Running,
    /// Manually paused; not scheduled.
    Paused,
    /// End date reached or schedule exhausted. Terminal except by delete.
    Completed,
    /// Last run failed. Still scheduled while the end date lies ahead.
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        self == TaskStatus::Completed
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// In-memory task state. Owned by the registry for its whole lifetime; every
/// mutation goes through registry methods so uniqueness and the status
/// invariants hold. The record owns its agent handle and its durable meta —
/// neither points back at the registry.
pub struct TaskRecord {
    pub task_id: String,
    pub account_id: String,
    pub account_name: String,
    pub task_type: TaskType,
    pub sys_type: SysType,

    pub mode: TaskMode,
    pub params: AgentParams,
    pub interval_secs: u32,
    pub valid_hours: Option<HourWindow>,
    pub end_date: NaiveDate,

    pub status: TaskStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub last_execution_time: Option<NaiveDateTime>,
    pub next_execution_time: Option<NaiveDateTime>,
    pub round_num: u64,

    /// Delete requested while a run was in flight; honored after the run.
    pub pending_delete: bool,

    /// Cached login probe result, refreshed by the login endpoints and
    /// before each run.
    pub login_status: LoginProbe,
    pub login_checked_at: Option<NaiveDateTime>,

    pub workspace: PathBuf,
    pub agent: Arc<dyn OperatorAgent>,
    pub meta: MetaStore,
}

impl TaskRecord {
    pub fn touch(&mut self, now: NaiveDateTime) {
        self.updated_at = now;
    }

    pub fn set_status(&mut self, status: TaskStatus, now: NaiveDateTime) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            account_id: self.account_id.clone(),
            account_name: self.account_name.clone(),
            task_type: self.task_type,
            sys_type: self.sys_type,
            status: self.status,
            mode: self.mode,
            params: self.params.clone(),
            interval_secs: self.interval_secs,
            valid_hours: self.valid_hours,
            end_date: self.end_date,
            last_execution_time: self.last_execution_time,
            next_execution_time: self.next_execution_time,
            created_at: self.created_at,
            updated_at: self.updated_at,
            round_num: self.round_num,
            login_status: self.login_status,
            login_checked_at: self.login_checked_at,
        }
    }
}

impl std::fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRecord")
            .field("task_id", &self.task_id)
            .field("account_id", &self.account_id)
            .field("status", &self.status)
            .field("next_execution_time", &self.next_execution_time)
            .finish_non_exhaustive()
    }
}

/// Plain-data copy of a task, returned by every task-returning operation and
/// stored verbatim in the dispatcher snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub account_id: String,
    pub account_name: String,
    pub task_type: TaskType,
    pub sys_type: SysType,
    pub status: TaskStatus,
    pub mode: TaskMode,
    #[serde(rename = "kwargs")]
    pub params: AgentParams,
    pub interval_secs: u32,
    pub valid_hours: Option<HourWindow>,
    pub end_date: NaiveDate,
    pub last_execution_time: Option<NaiveDateTime>,
    pub next_execution_time: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub round_num: u64,
    #[serde(default = "unknown_probe")]
    pub login_status: LoginProbe,
    #[serde(default)]
    pub login_checked_at: Option<NaiveDateTime>,
}

fn unknown_probe() -> LoginProbe {
    LoginProbe::Unknown
}

/// Inputs for creating a task. Cadence fields fall back to the operator
/// defaults (hourly, 08-22, thirty days) when omitted.
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub account_id: String,
    pub account_name: String,
    pub task_type: TaskType,
    pub sys_type: SysType,
    pub mode: Option<TaskMode>,
    pub params: Option<AgentParams>,
    pub interval_secs: Option<u32>,
    pub valid_hours: Option<HourWindow>,
    pub end_date: Option<NaiveDate>,
}

/// Partial update. Identity fields are immutable and therefore absent.
/// `valid_hours` distinguishes "leave unchanged" (outer None) from "clear
/// the restriction" (Some(None)).
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskRequest {
    pub mode: Option<TaskMode>,
    pub params: Option<AgentParams>,
    pub interval_secs: Option<u32>,
    pub valid_hours: Option<Option<HourWindow>>,
    pub end_date: Option<NaiveDate>,
}

impl UpdateTaskRequest {
    /// Whether this update touches anything the next-execution time depends on.
    pub fn reschedules(&self) -> bool {
        self.interval_secs.is_some() || self.valid_hours.is_some() || self.end_date.is_some()
    }
}

/// Listing filter.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub account_id: Option<String>,
    pub status: Option<TaskStatus>,
}
