//! The closed error set of the scheduler control plane.
//!
//! Every fallible operation surfaces one of these reasons; callers match on
//! the variant, never on message text.

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure reasons surfaced by the scheduler and its control plane.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No task with the given id (or account) exists.
    #[error("task not found: {0}")]
    NotFound(String),

    /// A task for the same (task_type, account_id) already exists.
    #[error("account '{account_id}' already has task '{task_id}'")]
    AccountTaken { account_id: String, task_id: String },

    /// Malformed input: bad cadence, bad enum value, negative interval.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The operation is not allowed in the task's current status.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The license does not allow creating another task.
    #[error("task limit reached (max {max})")]
    TaskLimitReached { max: usize },

    /// The activated license has passed its end time.
    #[error("license expired")]
    LicenseExpired,

    /// The operation requires an activated license.
    #[error("operation requires an activated license")]
    LicenseForbidden,

    /// The global execution lock could not be acquired in time.
    #[error("another task is currently executing")]
    Busy,

    /// The agent collaborator failed.
    #[error("agent error: {0}")]
    AgentError(String),

    /// A durable write or read failed; in-memory state was rolled back.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// The registry snapshot could not be parsed.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for SchedulerError {
    fn from(e: std::io::Error) -> Self {
        SchedulerError::PersistenceError(e.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::PersistenceError(e.to_string())
    }
}
