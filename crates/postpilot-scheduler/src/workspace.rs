//! Per-task workspace on disk: credentials, generated content, logs.
//!
//! Layout under `<data>/tasks/<task_id>/`:
//!
//! ```text
//! meta.json            # durable meta (meta module)
//! cookies/cookies.json # task-owned credentials
//! content/             # agent output (agent-defined shape)
//! logs/task.log        # run summaries, tailed by the control plane
//! ```
//!
//! The cookie hooks move credentials between the task-owned copy and the
//! process-wide shared cookie file the automation backend reads. Both hooks
//! run inside the global execution lock — the shared file has exactly one
//! writer at any moment.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use postpilot_core::{Result, SchedulerError};

const COOKIE_FILE: &str = "cookies.json";
const LOG_FILE: &str = "task.log";

/// Create the workspace directory tree for a new task.
pub fn create(tasks_dir: &Path, task_id: &str) -> Result<PathBuf> {
    let root = tasks_dir.join(task_id);
    for sub in ["cookies", "content", "logs"] {
        fs::create_dir_all(root.join(sub))?;
    }
    Ok(root)
}

/// Remove a task's workspace, credentials and logs included.
pub fn remove(workspace: &Path) -> Result<()> {
    if workspace.exists() {
        fs::remove_dir_all(workspace)?;
    }
    Ok(())
}

/// Task-owned cookie file path.
pub fn cookie_path(workspace: &Path) -> PathBuf {
    workspace.join("cookies").join(COOKIE_FILE)
}

/// Populate the shared cookie file from the task-owned copy. When the task
/// has no stored credentials the stale shared file is removed instead, so
/// the automation backend starts a fresh login. Returns whether credentials
/// were staged.
pub fn stage_cookies(workspace: &Path, shared: &Path) -> Result<bool> {
    let source = cookie_path(workspace);
    if !source.is_file() {
        tracing::warn!(
            "no stored cookies at {}, clearing shared cookie file",
            source.display()
        );
        remove_shared_cookies(shared);
        return Ok(false);
    }
    if let Some(parent) = shared.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&source, shared).map_err(|e| {
        SchedulerError::PersistenceError(format!("staging cookies for run failed: {e}"))
    })?;
    tracing::debug!("cookies staged: {} -> {}", source.display(), shared.display());
    Ok(true)
}

/// Sync the (possibly refreshed) shared cookie file back into the task
/// workspace, then delete it. Best-effort on the sync — a failed copy must
/// not fail the run that just completed — but the delete always happens.
pub fn collect_cookies(workspace: &Path, shared: &Path) {
    if shared.is_file() {
        let target = cookie_path(workspace);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).ok();
        }
        match fs::copy(shared, &target) {
            Ok(_) => tracing::debug!("cookies collected back to {}", target.display()),
            Err(e) => tracing::warn!("cookie sync-back failed: {e}"),
        }
    }
    remove_shared_cookies(shared);
}

fn remove_shared_cookies(shared: &Path) {
    if shared.is_file() {
        if let Err(e) = fs::remove_file(shared) {
            tracing::warn!("failed to remove shared cookie file: {e}");
        }
    }
}

/// Append one summary line to the task log.
pub fn append_log(workspace: &Path, at: NaiveDateTime, line: &str) {
    let path = workspace.join("logs").join(LOG_FILE);
    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| writeln!(f, "{} {line}", at.format("%Y-%m-%d %H:%M:%S")));
    if let Err(e) = result {
        tracing::warn!("failed to append task log {}: {e}", path.display());
    }
}

/// Last `lines` lines of the task log. Missing file reads as empty.
pub fn tail_log(workspace: &Path, lines: usize) -> Result<Vec<String>> {
    let path = workspace.join("logs").join(LOG_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("postpilot-test-ws-{tag}"));
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn create_makes_expected_tree() {
        let dir = scratch("tree");
        let ws = create(&dir, "t-1").unwrap();
        assert!(ws.join("cookies").is_dir());
        assert!(ws.join("content").is_dir());
        assert!(ws.join("logs").is_dir());
        remove(&ws).unwrap();
        assert!(!ws.exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stage_and_collect_round_trip() {
        let dir = scratch("cookies");
        let ws = create(&dir, "t-1").unwrap();
        let shared = dir.join("shared").join(COOKIE_FILE);

        // no stored cookies: staging reports false and leaves nothing behind
        assert!(!stage_cookies(&ws, &shared).unwrap());
        assert!(!shared.exists());

        fs::write(cookie_path(&ws), b"{\"session\":\"abc\"}").unwrap();
        assert!(stage_cookies(&ws, &shared).unwrap());
        assert!(shared.is_file());

        // backend refreshed the shared copy during the run
        fs::write(&shared, b"{\"session\":\"refreshed\"}").unwrap();
        collect_cookies(&ws, &shared);
        assert!(!shared.exists());
        let stored = fs::read_to_string(cookie_path(&ws)).unwrap();
        assert!(stored.contains("refreshed"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn log_tail_returns_last_lines() {
        let dir = scratch("log");
        let ws = create(&dir, "t-1").unwrap();
        let at = NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        for i in 0..5 {
            append_log(&ws, at, &format!("round {i} ok"));
        }
        let tail = tail_log(&ws, 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].ends_with("round 4 ok"));
        assert!(tail_log(&dir.join("missing"), 10).unwrap().is_empty());
        fs::remove_dir_all(&dir).ok();
    }
}
