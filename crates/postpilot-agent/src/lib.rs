//! # PostPilot Agent
//!
//! The collaborator contract between the scheduler and the browser-automation
//! operator, plus the client that fulfils it against the local MCP automation
//! service.
//!
//! The scheduler sees an agent as an opaque object with a single [`run_once`]
//! step and three login probes. Everything behind those calls — browser
//! driving, content generation, tool calls — lives in the automation service
//! and is out of this crate's hands.
//!
//! [`run_once`]: OperatorAgent::run_once

pub mod client;
pub mod factory;

use std::path::PathBuf;

use async_trait::async_trait;
use postpilot_core::types::{AgentParams, TaskMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::McpOperatorAgent;
pub use factory::{AgentBlueprint, AgentFactory, McpAgentFactory};

/// Failures reported by an agent. The dispatcher converts these into the
/// task's `error` status; the control plane surfaces them as `AgentError`.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("automation service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("automation service error: {0}")]
    Service(String),

    #[error("no agent available for task type '{0}'")]
    UnknownTaskType(String),
}

/// Cheap login probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginProbe {
    LoggedIn,
    NotLoggedIn,
    Unknown,
}

/// Outcome of starting a credential exchange.
#[derive(Debug, Clone)]
pub enum LoginHandshake {
    /// PNG bytes for the control plane to relay to the user.
    QrCode(Vec<u8>),
    AlreadyLoggedIn,
}

/// Up-to-date snapshot of the task handed to the agent for one round. The
/// scheduler rebuilds this before every invocation so mode or parameter
/// changes made mid-run apply to the next run.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub task_id: String,
    pub account_id: String,
    pub account_name: String,
    pub mode: TaskMode,
    pub round: u64,
    pub params: AgentParams,
    /// Task-owned directory holding credentials, generated content and logs.
    #[serde(skip)]
    pub workspace: PathBuf,
}

/// One iteration of the operator workflow, plus login probes.
///
/// `run_once` returns `Ok(true)` when the task may be scheduled again and
/// `Ok(false)` when the agent considers the task ended; the scheduler checks
/// the end date independently either way. Implementations must be safe to
/// call from the single dispatcher task while the global execution lock is
/// held.
#[async_trait]
pub trait OperatorAgent: Send + Sync {
    /// Perform exactly one round of the operator workflow.
    async fn run_once(&self, ctx: RunContext) -> Result<bool, AgentError>;

    /// Cheap probe of the account's login state.
    async fn login_status(&self) -> Result<LoginProbe, AgentError>;

    /// Start a credential exchange; yields a QR code unless already logged in.
    async fn begin_login(&self) -> Result<LoginHandshake, AgentError>;

    /// Finalize a credential exchange. Returns the final login state.
    async fn confirm_login(&self) -> Result<bool, AgentError>;
}
