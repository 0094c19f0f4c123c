//! # PostPilot Core
//!
//! Shared foundation for the PostPilot operator scheduler: the application
//! configuration, the closed error set every operation reports from, and a
//! few path helpers for the on-disk data layout.
//!
//! Everything here is transport-agnostic — the scheduler crate and the agent
//! crate both build on top of this one, never the other way around.

pub mod config;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, SchedulerError};
pub use types::{AgentParams, SysType, TaskMode, TaskType};
