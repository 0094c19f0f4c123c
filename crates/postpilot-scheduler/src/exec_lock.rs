//! The global execution lock.
//!
//! One process-wide mutex held for the entire duration of a `run_once` plus
//! the surrounding state transitions and cookie hooks. The automation
//! backend and the shared cookie file are single-writer resources, so this
//! serialization is a correctness requirement, not a tuning choice. Not
//! re-entrant; never held across the wait between runs.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct ExecutionLock {
    inner: Mutex<()>,
}

/// Proof that the holder may drive the automation backend.
pub type ExecutionGuard<'a> = MutexGuard<'a, ()>;

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the current run (if any) finishes.
    pub async fn acquire(&self) -> ExecutionGuard<'_> {
        self.inner.lock().await
    }

    /// Bounded wait used by execute-now; `None` means still busy after
    /// `wait`.
    pub async fn acquire_timeout(&self, wait: Duration) -> Option<ExecutionGuard<'_>> {
        tokio::time::timeout(wait, self.inner.lock()).await.ok()
    }
}
