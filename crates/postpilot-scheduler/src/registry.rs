//! The task registry — exclusive owner of every task record from creation to
//! deletion.
//!
//! All mutation goes through methods here, under one registry-level mutex, so
//! the three invariants hold at every instant:
//!
//! 1. at most one record per (task_type, account_id)
//! 2. `next_execution_time` is null iff the task is paused, completed, or has
//!    no schedulable time left
//! 3. at most one record is `running` (in cooperation with the global
//!    execution lock)
//!
//! Every mutation persists the registry snapshot before returning; a failed
//! save rolls the in-memory change back so disk and memory never disagree.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDateTime};
use postpilot_agent::{
    AgentBlueprint, AgentFactory, LoginProbe, OperatorAgent, RunContext,
};
use postpilot_core::types::{AgentParams, TaskType};
use postpilot_core::{Result, SchedulerError};
use uuid::Uuid;

use crate::clock::{self, Clock, HourWindow};
use crate::meta::{MetaStore, StepRecord, TaskMeta};
use crate::snapshot::{RegistrySnapshot, SnapshotStore, SNAPSHOT_VERSION};
use crate::task::{
    CreateTaskRequest, TaskFilter, TaskRecord, TaskSnapshot, TaskStatus, UpdateTaskRequest,
};
use crate::workspace;

/// Cadence defaults applied when a create request omits fields.
pub const DEFAULT_INTERVAL_SECS: u32 = 3600;
pub const DEFAULT_WINDOW: HourWindow = HourWindow { start: 8, end: 22 };
pub const DEFAULT_LIFETIME_DAYS: i64 = 30;
/// Floor below which an interval is rejected as invalid.
pub const MIN_INTERVAL_SECS: u32 = 60;

/// What `delete` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Record and workspace are gone.
    Removed,
    /// The task is mid-run; removal happens after the run returns.
    Deferred,
}

/// Everything the dispatcher needs to drive one run without holding the
/// registry lock across the await.
pub struct RunHandle {
    pub task_id: String,
    pub account_id: String,
    pub workspace: PathBuf,
    pub agent: Arc<dyn OperatorAgent>,
    pub ctx: RunContext,
}

struct Inner {
    tasks: HashMap<String, TaskRecord>,
    /// (task_type, account_id) -> task_id
    accounts: HashMap<(TaskType, String), String>,
    running: Option<String>,
}

/// Plain-field backup used to roll a record back after a failed save.
struct FieldBackup {
    mode: postpilot_core::types::TaskMode,
    params: AgentParams,
    interval_secs: u32,
    valid_hours: Option<HourWindow>,
    end_date: chrono::NaiveDate,
    status: TaskStatus,
    next_execution_time: Option<NaiveDateTime>,
    pending_delete: bool,
    updated_at: NaiveDateTime,
}

impl FieldBackup {
    fn of(rec: &TaskRecord) -> Self {
        Self {
            mode: rec.mode,
            params: rec.params.clone(),
            interval_secs: rec.interval_secs,
            valid_hours: rec.valid_hours,
            end_date: rec.end_date,
            status: rec.status,
            next_execution_time: rec.next_execution_time,
            pending_delete: rec.pending_delete,
            updated_at: rec.updated_at,
        }
    }

    fn restore(self, rec: &mut TaskRecord) {
        rec.mode = self.mode;
        rec.params = self.params;
        rec.interval_secs = self.interval_secs;
        rec.valid_hours = self.valid_hours;
        rec.end_date = self.end_date;
        rec.status = self.status;
        rec.next_execution_time = self.next_execution_time;
        rec.pending_delete = self.pending_delete;
        rec.updated_at = self.updated_at;
    }
}

pub struct Registry {
    clock: Arc<dyn Clock>,
    factory: Arc<dyn AgentFactory>,
    store: SnapshotStore,
    tasks_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(
        clock: Arc<dyn Clock>,
        factory: Arc<dyn AgentFactory>,
        store: SnapshotStore,
        tasks_dir: PathBuf,
    ) -> Self {
        Self {
            clock,
            factory,
            store,
            tasks_dir,
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                accounts: HashMap::new(),
                running: None,
            }),
        }
    }

    // ─── Startup ──────────────────────────────────────────────

    /// Load the snapshot and rebuild records. Returns how many tasks were
    /// restored. A corrupt snapshot logs a warning and starts empty; an
    /// entry whose agent cannot be rebuilt is skipped, the rest load.
    pub fn restore(&self) -> usize {
        let snapshot = match self.store.load() {
            Ok(Some(s)) => s,
            Ok(None) => {
                tracing::info!("no snapshot yet, starting with an empty registry");
                return 0;
            }
            Err(e) => {
                tracing::warn!("⚠️ snapshot unreadable, starting empty: {e}");
                return 0;
            }
        };

        let mut inner = self.inner.lock().unwrap();
        let total = snapshot.tasks.len();
        for entry in snapshot.tasks {
            let task_id = entry.task_id.clone();
            match self.rebuild_record(entry) {
                Ok(rec) => {
                    inner
                        .accounts
                        .insert((rec.task_type, rec.account_id.clone()), task_id.clone());
                    inner.tasks.insert(task_id, rec);
                }
                Err(e) => {
                    tracing::error!("failed to restore task '{task_id}': {e}");
                }
            }
        }
        let restored = inner.tasks.len();
        tracing::info!("📂 registry restored: {restored}/{total} tasks");
        restored
    }

    fn rebuild_record(&self, entry: TaskSnapshot) -> Result<TaskRecord> {
        let workspace = workspace::create(&self.tasks_dir, &entry.task_id)?;
        let blueprint = AgentBlueprint {
            task_type: entry.task_type,
            sys_type: entry.sys_type,
            account_id: entry.account_id.clone(),
            account_name: entry.account_name.clone(),
            params: entry.params.clone(),
            workspace: workspace.clone(),
        };
        let agent = self
            .factory
            .build(&blueprint)
            .map_err(|e| SchedulerError::AgentError(e.to_string()))?;
        let meta = MetaStore::load_or_init(&workspace, self.meta_defaults(&entry))?;

        // The previous process died mid-run: the run is gone, the task is not.
        let (status, next_execution_time) = if entry.status == TaskStatus::Running {
            tracing::warn!(
                "task '{}' was running when the process stopped, resetting to pending",
                entry.task_id
            );
            let next = clock::next_execution(
                self.clock.now(),
                entry.last_execution_time,
                entry.interval_secs,
                entry.valid_hours,
                entry.end_date,
            );
            match next {
                Some(t) => (TaskStatus::Pending, Some(t)),
                None => (TaskStatus::Completed, None),
            }
        } else {
            (entry.status, entry.next_execution_time)
        };

        Ok(TaskRecord {
            task_id: entry.task_id,
            account_id: entry.account_id,
            account_name: entry.account_name,
            task_type: entry.task_type,
            sys_type: entry.sys_type,
            mode: entry.mode,
            params: entry.params,
            interval_secs: entry.interval_secs,
            valid_hours: entry.valid_hours,
            end_date: entry.end_date,
            status,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            last_execution_time: entry.last_execution_time,
            next_execution_time,
            round_num: entry.round_num,
            pending_delete: false,
            login_status: entry.login_status,
            login_checked_at: entry.login_checked_at,
            workspace,
            agent,
            meta,
        })
    }

    fn meta_defaults(&self, entry: &TaskSnapshot) -> TaskMeta {
        TaskMeta {
            task_id: entry.task_id.clone(),
            account_id: entry.account_id.clone(),
            account_name: entry.account_name.clone(),
            task_type: entry.task_type,
            sys_type: entry.sys_type,
            mode: entry.mode,
            params: entry.params.clone(),
            interval_secs: entry.interval_secs,
            valid_hours: entry.valid_hours,
            end_date: entry.end_date,
            round_num: entry.round_num,
            login_status: None,
            login_checked_at: None,
            last_updated: None,
            steps: Vec::new(),
        }
    }

    // ─── Mutations ────────────────────────────────────────────

    /// Create a task. The caller (control plane) has already applied the
    /// license gate; cadence fields fall back to the operator defaults.
    pub fn add(&self, req: CreateTaskRequest) -> Result<TaskSnapshot> {
        if req.account_id.trim().is_empty() {
            return Err(SchedulerError::Invalid("account_id must not be empty".into()));
        }
        let interval_secs = req.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS);
        if interval_secs < MIN_INTERVAL_SECS {
            return Err(SchedulerError::Invalid(format!(
                "interval must be at least {MIN_INTERVAL_SECS}s, got {interval_secs}"
            )));
        }
        let params = match req.params {
            Some(p) => {
                if p.task_type() != req.task_type {
                    return Err(SchedulerError::Invalid(format!(
                        "params tagged '{}' do not match task type '{}'",
                        p.task_type(),
                        req.task_type
                    )));
                }
                p
            }
            None => AgentParams::empty(req.task_type),
        };
        let valid_hours = req.valid_hours.or(Some(DEFAULT_WINDOW));
        let now = self.clock.now();
        let end_date = req
            .end_date
            .unwrap_or_else(|| now.date() + Duration::days(DEFAULT_LIFETIME_DAYS));

        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .accounts
            .get(&(req.task_type, req.account_id.clone()))
        {
            return Err(SchedulerError::AccountTaken {
                account_id: req.account_id,
                task_id: existing.clone(),
            });
        }

        let task_id = Uuid::new_v4().to_string();
        let ws = workspace::create(&self.tasks_dir, &task_id)?;

        let blueprint = AgentBlueprint {
            task_type: req.task_type,
            sys_type: req.sys_type,
            account_id: req.account_id.clone(),
            account_name: req.account_name.clone(),
            params: params.clone(),
            workspace: ws.clone(),
        };
        let agent = match self.factory.build(&blueprint) {
            Ok(a) => a,
            Err(e) => {
                workspace::remove(&ws).ok();
                return Err(SchedulerError::AgentError(e.to_string()));
            }
        };

        let meta = match MetaStore::load_or_init(
            &ws,
            TaskMeta {
                task_id: task_id.clone(),
                account_id: req.account_id.clone(),
                account_name: req.account_name.clone(),
                task_type: req.task_type,
                sys_type: req.sys_type,
                mode: req.mode.unwrap_or_default(),
                params: params.clone(),
                interval_secs,
                valid_hours,
                end_date,
                round_num: 0,
                login_status: None,
                login_checked_at: None,
                last_updated: Some(now),
                steps: Vec::new(),
            },
        ) {
            Ok(m) => m,
            Err(e) => {
                workspace::remove(&ws).ok();
                return Err(e);
            }
        };

        let next = clock::next_execution(now, None, interval_secs, valid_hours, end_date);
        let status = if next.is_some() {
            TaskStatus::Pending
        } else {
            TaskStatus::Completed
        };

        let rec = TaskRecord {
            task_id: task_id.clone(),
            account_id: req.account_id.clone(),
            account_name: req.account_name,
            task_type: req.task_type,
            sys_type: req.sys_type,
            mode: req.mode.unwrap_or_default(),
            params,
            interval_secs,
            valid_hours,
            end_date,
            status,
            created_at: now,
            updated_at: now,
            last_execution_time: None,
            next_execution_time: next,
            round_num: 0,
            pending_delete: false,
            login_status: LoginProbe::Unknown,
            login_checked_at: None,
            workspace: ws.clone(),
            agent,
            meta,
        };

        let snap = rec.snapshot();
        inner
            .accounts
            .insert((rec.task_type, rec.account_id.clone()), task_id.clone());
        inner.tasks.insert(task_id.clone(), rec);

        if let Err(e) = self.save_locked(&inner) {
            let rec = inner.tasks.remove(&task_id);
            if let Some(rec) = rec {
                inner.accounts.remove(&(rec.task_type, rec.account_id));
            }
            workspace::remove(&ws).ok();
            return Err(e);
        }

        tracing::info!(
            "📅 task added: '{}' for account '{}', next run {:?}",
            task_id,
            snap.account_id,
            snap.next_execution_time
        );
        Ok(snap)
    }

    /// Apply a partial update. Identity fields are immutable. When cadence
    /// changes on a pending task the next execution time is recomputed; a
    /// running task accepts the update and picks it up after the current run.
    pub fn update(&self, task_id: &str, upd: UpdateTaskRequest) -> Result<TaskSnapshot> {
        if let Some(interval) = upd.interval_secs {
            if interval < MIN_INTERVAL_SECS {
                return Err(SchedulerError::Invalid(format!(
                    "interval must be at least {MIN_INTERVAL_SECS}s, got {interval}"
                )));
            }
        }

        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let today = now.date();
        let rec = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        if let Some(ref p) = upd.params {
            if p.task_type() != rec.task_type {
                return Err(SchedulerError::Invalid(format!(
                    "params tagged '{}' do not match task type '{}'",
                    p.task_type(),
                    rec.task_type
                )));
            }
        }
        if rec.status == TaskStatus::Running {
            tracing::info!("task '{task_id}' is running, update applies to the next run");
        }

        let backup = FieldBackup::of(rec);
        if let Some(mode) = upd.mode {
            rec.mode = mode;
        }
        if let Some(params) = upd.params.clone() {
            rec.params = params;
        }
        if let Some(interval) = upd.interval_secs {
            rec.interval_secs = interval;
        }
        if let Some(window) = upd.valid_hours {
            rec.valid_hours = window;
        }
        if let Some(end_date) = upd.end_date {
            rec.end_date = end_date;
        }

        if upd.reschedules() && rec.status == TaskStatus::Pending {
            if today >= rec.end_date {
                rec.status = TaskStatus::Completed;
                rec.next_execution_time = None;
            } else {
                match clock::next_execution(
                    now,
                    rec.last_execution_time,
                    rec.interval_secs,
                    rec.valid_hours,
                    rec.end_date,
                ) {
                    Some(t) => rec.next_execution_time = Some(t),
                    None => {
                        rec.status = TaskStatus::Completed;
                        rec.next_execution_time = None;
                    }
                }
            }
        }
        rec.touch(now);

        let mode = rec.mode;
        let params = rec.params.clone();
        let interval_secs = rec.interval_secs;
        let valid_hours = rec.valid_hours;
        let end_date = rec.end_date;
        if let Err(e) = rec.meta.update(|m| {
            m.mode = mode;
            m.params = params;
            m.interval_secs = interval_secs;
            m.valid_hours = valid_hours;
            m.end_date = end_date;
            m.last_updated = Some(now);
        }) {
            backup.restore(rec);
            return Err(e);
        }

        let snap = rec.snapshot();
        if let Err(e) = self.save_locked(&inner) {
            if let Some(rec) = inner.tasks.get_mut(task_id) {
                backup.restore(rec);
            }
            return Err(e);
        }
        Ok(snap)
    }

    /// Remove a task. A running task is only marked; the dispatcher removes
    /// it right after the current run returns.
    pub fn delete(&self, task_id: &str) -> Result<DeleteOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let rec = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        if rec.status == TaskStatus::Running {
            let backup = FieldBackup::of(rec);
            rec.pending_delete = true;
            rec.touch(now);
            if let Err(e) = self.save_locked(&inner) {
                if let Some(rec) = inner.tasks.get_mut(task_id) {
                    backup.restore(rec);
                }
                return Err(e);
            }
            tracing::info!("task '{task_id}' is running, delete deferred until the run ends");
            return Ok(DeleteOutcome::Deferred);
        }

        let rec = inner.tasks.remove(task_id).expect("checked above");
        let key = (rec.task_type, rec.account_id.clone());
        inner.accounts.remove(&key);
        if let Err(e) = self.save_locked(&inner) {
            inner.accounts.insert(key, task_id.to_string());
            inner.tasks.insert(task_id.to_string(), rec);
            return Err(e);
        }
        if let Err(e) = workspace::remove(&rec.workspace) {
            tracing::warn!("failed to remove workspace of '{task_id}': {e}");
        }
        tracing::info!("🗑️ task deleted: '{task_id}'");
        Ok(DeleteOutcome::Removed)
    }

    /// Pause scheduling. No-op when already paused or completed. Pausing a
    /// running task lets the current run finish and keeps the task paused
    /// afterwards.
    pub fn pause(&self, task_id: &str) -> Result<TaskSnapshot> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let rec = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        if matches!(rec.status, TaskStatus::Paused | TaskStatus::Completed) {
            return Ok(rec.snapshot());
        }

        let backup = FieldBackup::of(rec);
        rec.status = TaskStatus::Paused;
        rec.next_execution_time = None;
        rec.touch(now);
        let snap = rec.snapshot();
        if let Err(e) = self.save_locked(&inner) {
            if let Some(rec) = inner.tasks.get_mut(task_id) {
                backup.restore(rec);
            }
            return Err(e);
        }
        tracing::info!("⏸️ task paused: '{task_id}'");
        Ok(snap)
    }

    /// Resume a paused task.
    pub fn resume(&self, task_id: &str) -> Result<TaskSnapshot> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let rec = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        if rec.status != TaskStatus::Paused {
            return Err(SchedulerError::IllegalState(format!(
                "task '{task_id}' is {}, only paused tasks can be resumed",
                rec.status
            )));
        }

        let backup = FieldBackup::of(rec);
        match clock::next_execution(
            now,
            rec.last_execution_time,
            rec.interval_secs,
            rec.valid_hours,
            rec.end_date,
        ) {
            Some(t) => {
                rec.status = TaskStatus::Pending;
                rec.next_execution_time = Some(t);
            }
            None => {
                rec.status = TaskStatus::Completed;
                rec.next_execution_time = None;
            }
        }
        rec.touch(now);
        let snap = rec.snapshot();
        if let Err(e) = self.save_locked(&inner) {
            if let Some(rec) = inner.tasks.get_mut(task_id) {
                backup.restore(rec);
            }
            return Err(e);
        }
        tracing::info!(
            "▶️ task resumed: '{task_id}', next run {:?}",
            snap.next_execution_time
        );
        Ok(snap)
    }

    /// Shift the next execution time by `offset_secs` (negative = earlier).
    /// The result snaps forward into the validity window; a shift past the
    /// end date completes the task instead.
    pub fn reorder(&self, task_id: &str, offset_secs: i64) -> Result<TaskSnapshot> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let rec = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        if rec.status != TaskStatus::Pending {
            return Err(SchedulerError::IllegalState(format!(
                "cannot reorder task '{task_id}' while {}",
                rec.status
            )));
        }
        let current = rec.next_execution_time.ok_or_else(|| {
            SchedulerError::IllegalState(format!("task '{task_id}' has no next execution time"))
        })?;

        let backup = FieldBackup::of(rec);
        let mut shifted = current + Duration::seconds(offset_secs);
        if !clock::in_window(shifted, rec.valid_hours) {
            shifted = clock::advance_to_next_valid(shifted, rec.valid_hours);
        }
        if shifted.date() >= rec.end_date {
            rec.status = TaskStatus::Completed;
            rec.next_execution_time = None;
        } else {
            rec.next_execution_time = Some(shifted);
        }
        rec.touch(now);
        let snap = rec.snapshot();
        if let Err(e) = self.save_locked(&inner) {
            if let Some(rec) = inner.tasks.get_mut(task_id) {
                backup.restore(rec);
            }
            return Err(e);
        }
        Ok(snap)
    }

    /// Cache the result of a login probe on the record and its meta.
    pub fn record_login(&self, task_id: &str, probe: LoginProbe) -> Result<TaskSnapshot> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let rec = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
        rec.login_status = probe;
        rec.login_checked_at = Some(now);
        let logged_in = match probe {
            LoginProbe::LoggedIn => Some(true),
            LoginProbe::NotLoggedIn => Some(false),
            LoginProbe::Unknown => None,
        };
        if let Err(e) = rec.meta.update(|m| {
            m.login_status = logged_in;
            m.login_checked_at = Some(now);
        }) {
            tracing::warn!("failed to persist login probe for '{task_id}': {e}");
        }
        let snap = rec.snapshot();
        if let Err(e) = self.save_locked(&inner) {
            tracing::warn!("failed to persist login probe for '{task_id}': {e}");
        }
        Ok(snap)
    }

    // ─── Run lifecycle (used by the dispatcher and execute-now) ──

    /// Transition a due task to running for a scheduled dispatch. Returns
    /// `None` when the task is gone or no longer schedulable — the dispatch
    /// cycle just moves on.
    pub fn begin_scheduled_run(&self, task_id: &str) -> Option<RunHandle> {
        let mut inner = self.inner.lock().unwrap();
        if inner.running.is_some() {
            return None;
        }
        let now = self.clock.now();
        let rec = inner.tasks.get_mut(task_id)?;
        if !matches!(rec.status, TaskStatus::Pending | TaskStatus::Error) {
            return None;
        }
        Some(Self::mark_running(&mut inner, task_id, now))
    }

    /// Transition a task to running for execute-now. The caller already
    /// holds the global execution lock.
    pub fn begin_immediate_run(&self, task_id: &str) -> Result<RunHandle> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let rec = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
        match rec.status {
            TaskStatus::Completed => {
                return Err(SchedulerError::IllegalState(format!(
                    "task '{task_id}' is completed"
                )))
            }
            TaskStatus::Running => return Err(SchedulerError::Busy),
            TaskStatus::Paused => {
                tracing::warn!("task '{task_id}' is paused but will execute immediately")
            }
            TaskStatus::Pending | TaskStatus::Error => {}
        }
        if inner.running.is_some() {
            return Err(SchedulerError::Busy);
        }
        Ok(Self::mark_running(&mut inner, task_id, now))
    }

    fn mark_running(inner: &mut Inner, task_id: &str, now: NaiveDateTime) -> RunHandle {
        let rec = inner.tasks.get_mut(task_id).expect("caller checked presence");
        rec.set_status(TaskStatus::Running, now);
        workspace::append_log(
            &rec.workspace,
            now,
            &format!("round {} started", rec.round_num + 1),
        );
        let handle = RunHandle {
            task_id: rec.task_id.clone(),
            account_id: rec.account_id.clone(),
            workspace: rec.workspace.clone(),
            agent: Arc::clone(&rec.agent),
            ctx: RunContext {
                task_id: rec.task_id.clone(),
                account_id: rec.account_id.clone(),
                account_name: rec.account_name.clone(),
                mode: rec.mode,
                round: rec.round_num + 1,
                params: rec.params.clone(),
                workspace: rec.workspace.clone(),
            },
        };
        inner.running = Some(task_id.to_string());
        handle
    }

    /// Post-run bookkeeping, identical for scheduled and immediate runs:
    /// stamp the execution, append the step record, derive the follow-up
    /// status and next time, honor a deferred delete, persist.
    pub fn finish_run(
        &self,
        task_id: &str,
        started_at: NaiveDateTime,
        outcome: std::result::Result<bool, String>,
    ) -> Result<TaskSnapshot> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let today = now.date();
        let rec = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        rec.last_execution_time = Some(now);
        rec.round_num += 1;

        let outcome_tag = match &outcome {
            Ok(true) => "ok",
            Ok(false) => "ended",
            Err(_) => "error",
        };
        let step = StepRecord {
            round: rec.round_num,
            started_at,
            finished_at: now,
            outcome: outcome_tag.to_string(),
            note: outcome
                .as_ref()
                .err()
                .map(|e| serde_json::json!({ "error": e })),
        };
        if let Err(e) = rec.meta.append_step(step) {
            tracing::warn!("failed to append step for '{task_id}': {e}");
        }

        if rec.status == TaskStatus::Paused {
            // paused mid-run: the pause wins, scheduling stays off
        } else if today >= rec.end_date {
            rec.status = TaskStatus::Completed;
            rec.next_execution_time = None;
        } else {
            let next = clock::next_execution(
                now,
                rec.last_execution_time,
                rec.interval_secs,
                rec.valid_hours,
                rec.end_date,
            );
            match &outcome {
                Err(e) => {
                    tracing::error!(
                        "task '{task_id}' round {} failed: {e}",
                        rec.round_num
                    );
                    rec.status = TaskStatus::Error;
                    rec.next_execution_time = next;
                }
                Ok(true) => match next {
                    Some(t) => {
                        rec.status = TaskStatus::Pending;
                        rec.next_execution_time = Some(t);
                    }
                    None => {
                        rec.status = TaskStatus::Completed;
                        rec.next_execution_time = None;
                    }
                },
                Ok(false) => {
                    rec.status = TaskStatus::Completed;
                    rec.next_execution_time = None;
                }
            }
        }
        rec.touch(now);
        workspace::append_log(
            &rec.workspace,
            now,
            &format!("round {} finished: {outcome_tag}", rec.round_num),
        );

        let snap = rec.snapshot();
        let deferred_delete = rec.pending_delete;
        inner.running = None;

        if deferred_delete {
            let rec = inner.tasks.remove(task_id).expect("present above");
            inner.accounts.remove(&(rec.task_type, rec.account_id.clone()));
            if let Err(e) = self.save_locked(&inner) {
                tracing::error!("failed to persist deferred delete of '{task_id}': {e}");
            }
            if let Err(e) = workspace::remove(&rec.workspace) {
                tracing::warn!("failed to remove workspace of '{task_id}': {e}");
            }
            tracing::info!("🗑️ deferred delete applied: '{task_id}'");
            return Ok(snap);
        }

        if let Err(e) = self.save_locked(&inner) {
            tracing::error!("failed to persist post-run state of '{task_id}': {e}");
        }
        Ok(snap)
    }

    // ─── Reads ────────────────────────────────────────────────

    pub fn get(&self, task_id: &str) -> Result<TaskSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .get(task_id)
            .map(TaskRecord::snapshot)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))
    }

    pub fn get_by_account(&self, account_id: &str) -> Result<TaskSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .find(|r| r.account_id == account_id)
            .map(TaskRecord::snapshot)
            .ok_or_else(|| SchedulerError::NotFound(format!("account '{account_id}'")))
    }

    /// Snapshots matching the filter, ordered by next execution time
    /// ascending with null last, ties broken by creation time.
    pub fn list(&self, filter: &TaskFilter) -> Vec<TaskSnapshot> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<TaskSnapshot> = inner
            .tasks
            .values()
            .filter(|r| {
                filter
                    .account_id
                    .as_ref()
                    .is_none_or(|a| &r.account_id == a)
                    && filter.status.is_none_or(|s| r.status == s)
            })
            .map(TaskRecord::snapshot)
            .collect();
        out.sort_by_key(|s| (s.next_execution_time.is_none(), s.next_execution_time, s.created_at));
        out
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    /// The agent handle for login relays.
    pub fn agent_of(&self, task_id: &str) -> Result<Arc<dyn OperatorAgent>> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .get(task_id)
            .map(|r| Arc::clone(&r.agent))
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))
    }

    /// Head of the due set at `now`: schedulable, next time reached, ordered
    /// by (next_execution_time, created_at).
    pub fn due_task(&self, now: NaiveDateTime) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|r| {
                matches!(r.status, TaskStatus::Pending | TaskStatus::Error)
                    && r.next_execution_time.is_some_and(|t| t <= now)
            })
            .min_by_key(|r| (r.next_execution_time, r.created_at))
            .map(|r| r.task_id.clone())
    }

    /// Earliest upcoming execution time over all schedulable tasks.
    pub fn next_wake(&self) -> Option<NaiveDateTime> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|r| matches!(r.status, TaskStatus::Pending | TaskStatus::Error))
            .filter_map(|r| r.next_execution_time)
            .min()
    }

    /// Per-status counts plus the currently running task, for the dispatcher
    /// status operation.
    pub fn status_counts(&self) -> (HashMap<TaskStatus, usize>, Option<TaskSnapshot>) {
        let inner = self.inner.lock().unwrap();
        let mut counts = HashMap::new();
        for rec in inner.tasks.values() {
            *counts.entry(rec.status).or_insert(0) += 1;
        }
        let running = inner
            .running
            .as_ref()
            .and_then(|id| inner.tasks.get(id))
            .map(TaskRecord::snapshot);
        (counts, running)
    }

    /// Workspace directory of a task, for the log tail operation.
    pub fn workspace_of(&self, task_id: &str) -> Result<PathBuf> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .get(task_id)
            .map(|r| r.workspace.clone())
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))
    }

    /// Persist the current state; used by shutdown for a final save.
    pub fn persist(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        self.save_locked(&inner)
    }

    fn save_locked(&self, inner: &Inner) -> Result<()> {
        let mut tasks: Vec<TaskSnapshot> =
            inner.tasks.values().map(TaskRecord::snapshot).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let account_tasks = inner
            .accounts
            .iter()
            .map(|((_, account_id), task_id)| (account_id.clone(), task_id.clone()))
            .collect();
        let snapshot = RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: self.clock.now(),
            tasks,
            account_tasks,
        };
        self.store.save(&snapshot)
    }
}
