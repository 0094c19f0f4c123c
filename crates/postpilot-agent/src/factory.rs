//! Agent construction, at task creation and at snapshot load.
//!
//! The registry persists only the data needed to rebuild an agent handle
//! (task type, sys type, opaque params); the factory turns that back into a
//! live collaborator. Snapshot entries whose reconstruction fails are
//! skipped by the loader, so `build` failing must never panic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use postpilot_core::types::{AgentParams, SysType, TaskType};

use crate::{AgentError, McpOperatorAgent, OperatorAgent};

/// Everything needed to (re)construct an agent handle for one task.
#[derive(Debug, Clone)]
pub struct AgentBlueprint {
    pub task_type: TaskType,
    pub sys_type: SysType,
    pub account_id: String,
    pub account_name: String,
    pub params: AgentParams,
    pub workspace: PathBuf,
}

/// Builds agent handles from blueprints.
pub trait AgentFactory: Send + Sync {
    fn build(&self, blueprint: &AgentBlueprint) -> Result<Arc<dyn OperatorAgent>, AgentError>;
}

/// Production factory: every known task type maps onto the MCP automation
/// service client.
pub struct McpAgentFactory {
    service_url: String,
    probe_timeout: Duration,
}

impl McpAgentFactory {
    pub fn new(service_url: &str, probe_timeout: Duration) -> Self {
        Self {
            service_url: service_url.to_string(),
            probe_timeout,
        }
    }
}

impl AgentFactory for McpAgentFactory {
    fn build(&self, blueprint: &AgentBlueprint) -> Result<Arc<dyn OperatorAgent>, AgentError> {
        if blueprint.params.task_type() != blueprint.task_type {
            return Err(AgentError::Service(format!(
                "params tagged '{}' do not match task type '{}'",
                blueprint.params.task_type(),
                blueprint.task_type
            )));
        }
        match blueprint.task_type {
            TaskType::SocialOperator => {
                tracing::debug!(
                    "building operator agent for account '{}' ({})",
                    blueprint.account_id,
                    blueprint.sys_type
                );
                Ok(Arc::new(McpOperatorAgent::new(
                    &self.service_url,
                    &blueprint.account_id,
                    self.probe_timeout,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_social_operator_agent() {
        let factory = McpAgentFactory::new("http://localhost:18060", Duration::from_secs(5));
        let blueprint = AgentBlueprint {
            task_type: TaskType::SocialOperator,
            sys_type: SysType::MacIntel,
            account_id: "acc-1".into(),
            account_name: "Demo".into(),
            params: AgentParams::empty(TaskType::SocialOperator),
            workspace: PathBuf::from("/tmp"),
        };
        assert!(factory.build(&blueprint).is_ok());
    }
}
