//! The dispatch loop — one long-running coordinator that scans the registry
//! for due tasks, serializes every run behind the global execution lock, and
//! does the post-run bookkeeping.
//!
//! The wait between cycles is interruptible: every control-plane mutation
//! posts a wakeup, so a change made before the wake deadline is always seen
//! by the next cycle. There is no busy-wait; an idle scheduler sleeps until
//! the earliest next execution time, capped so a stale registry view never
//! sleeps past a fresh task for long.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use postpilot_core::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::exec_lock::ExecutionLock;
use crate::registry::{Registry, RunHandle};
use crate::task::TaskSnapshot;
use crate::workspace;

struct LoopState {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    exec_lock: Arc<ExecutionLock>,
    clock: Arc<dyn Clock>,
    shared_cookie_path: PathBuf,
    wakeup: Notify,
    idle_poll: Duration,
    shutdown_grace: Duration,
    loop_state: Mutex<Option<LoopState>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        exec_lock: Arc<ExecutionLock>,
        clock: Arc<dyn Clock>,
        shared_cookie_path: PathBuf,
        idle_poll: Duration,
        shutdown_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            exec_lock,
            clock,
            shared_cookie_path,
            wakeup: Notify::new(),
            idle_poll,
            shutdown_grace,
            loop_state: Mutex::new(None),
        })
    }

    /// Posted by every control-plane mutation so the loop re-evaluates its
    /// due set. A wake with no waiter is kept as a permit, not lost.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.loop_state
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Spawn the loop. No-op when it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.loop_state.lock().unwrap();
        if state.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            tracing::warn!("dispatcher already running");
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(Arc::clone(self).run_loop(Arc::clone(&stop)));
        *state = Some(LoopState { handle, stop });
        tracing::info!("⏰ dispatcher started");
    }

    /// Stop pulling new work and wait for the in-flight run, bounded by the
    /// shutdown grace window. The final registry state is persisted either
    /// way. A running task is never aborted by a plain stop — past the grace
    /// window the loop is simply abandoned.
    pub async fn stop(&self) {
        let state = self.loop_state.lock().unwrap().take();
        let Some(LoopState { handle, stop }) = state else {
            return;
        };
        tracing::info!("stopping dispatcher...");
        stop.store(true, Ordering::Relaxed);
        self.wakeup.notify_waiters();
        self.wake();
        if tokio::time::timeout(self.shutdown_grace, handle)
            .await
            .is_err()
        {
            tracing::warn!(
                "dispatcher did not stop within {}s, abandoning the in-flight run",
                self.shutdown_grace.as_secs()
            );
        }
        if let Err(e) = self.registry.persist() {
            tracing::error!("final snapshot save failed: {e}");
        }
        tracing::info!("dispatcher stopped");
    }

    async fn run_loop(self: Arc<Self>, stop: Arc<AtomicBool>) {
        tracing::info!("dispatch loop entered");
        while !stop.load(Ordering::Relaxed) {
            if self.poll_once().await {
                continue;
            }
            let wait = self.idle_wait();
            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!("dispatch loop exited");
    }

    /// One dispatch cycle: pick the head of the due set, run it under the
    /// global lock. Returns whether a task was attempted.
    pub async fn poll_once(&self) -> bool {
        let now = self.clock.now();
        let Some(task_id) = self.registry.due_task(now) else {
            return false;
        };
        let guard = self.exec_lock.acquire().await;
        // the task may have been paused, deleted, or run by execute-now
        // while we waited for the lock
        let Some(handle) = self.registry.begin_scheduled_run(&task_id) else {
            return true;
        };
        let _ = self.drive(handle).await;
        drop(guard);
        true
    }

    fn idle_wait(&self) -> Duration {
        let now = self.clock.now();
        match self.registry.next_wake() {
            Some(t) if t > now => {
                let until = (t - now).to_std().unwrap_or(Duration::ZERO);
                until.min(self.idle_poll)
            }
            // something became due since the scan; re-check immediately
            Some(_) => Duration::ZERO,
            None => self.idle_poll,
        }
    }

    /// Drive one run while the caller holds the global execution lock:
    /// credentials staged in, login probe refreshed, `run_once`, credentials
    /// collected back, registry bookkeeping. Shared by the loop and
    /// execute-now.
    pub(crate) async fn drive(&self, handle: RunHandle) -> Result<TaskSnapshot> {
        let started_at = self.clock.now();

        if let Err(e) = workspace::stage_cookies(&handle.workspace, &self.shared_cookie_path) {
            // the run proceeds; the agent will hit the login wall and report
            tracing::warn!("cookie staging for '{}' failed: {e}", handle.task_id);
        }
        match handle.agent.login_status().await {
            Ok(probe) => {
                let _ = self.registry.record_login(&handle.task_id, probe);
            }
            Err(e) => tracing::debug!("login probe for '{}' failed: {e}", handle.task_id),
        }

        let outcome = handle
            .agent
            .run_once(handle.ctx.clone())
            .await
            .map_err(|e| e.to_string());

        workspace::collect_cookies(&handle.workspace, &self.shared_cookie_path);

        self.registry.finish_run(&handle.task_id, started_at, outcome)
    }
}
