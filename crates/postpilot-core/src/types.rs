//! Base types shared by the scheduler and the agent collaborator.

use serde::{Deserialize, Serialize};

/// The closed set of task types the scheduler knows how to drive.
///
/// Today there is exactly one: the social-account operator. The enum exists
/// so the opaque agent parameters can be a tagged sum keyed by task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "social-account-operator")]
    SocialOperator,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::SocialOperator => write!(f, "social-account-operator"),
        }
    }
}

/// Host platform the automation backend was packaged for. Opaque to
/// scheduling; forwarded to the agent factory on reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SysType {
    Win64,
    MacIntel,
    MacSilicon,
}

impl std::fmt::Display for SysType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SysType::Win64 => "win64",
            SysType::MacIntel => "mac_intel",
            SysType::MacSilicon => "mac_silicon",
        };
        write!(f, "{s}")
    }
}

/// What the operator does during one round. Consumed only by the agent; the
/// scheduler stores and forwards it. A change made while a task is running
/// applies to the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Interact with posts and publish content.
    #[default]
    Standard,
    /// Interaction only.
    Interaction,
    /// Publishing only.
    Publish,
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskMode::Standard => "standard",
            TaskMode::Interaction => "interaction",
            TaskMode::Publish => "publish",
        };
        write!(f, "{s}")
    }
}

/// Agent-specific parameters, serialized verbatim and passed back to the
/// agent on reconstruction. Tagged by task type; one variant per type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type")]
pub enum AgentParams {
    #[serde(rename = "social-account-operator")]
    SocialOperator {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_query: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_topic: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_style: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_target_audience: Option<String>,
        /// How many posts to engage with per round, clamped to 1..=5 by the
        /// control plane.
        #[serde(default = "default_note_count")]
        interaction_note_count: u8,
    },
}

fn default_note_count() -> u8 {
    3
}

impl AgentParams {
    /// The task type this parameter set belongs to.
    pub fn task_type(&self) -> TaskType {
        match self {
            AgentParams::SocialOperator { .. } => TaskType::SocialOperator,
        }
    }

    /// Empty parameter set for the given task type.
    pub fn empty(task_type: TaskType) -> Self {
        match task_type {
            TaskType::SocialOperator => AgentParams::SocialOperator {
                user_query: None,
                user_topic: None,
                user_style: None,
                user_target_audience: None,
                interaction_note_count: default_note_count(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_roundtrip_tagged_by_task_type() {
        let p = AgentParams::SocialOperator {
            user_query: Some("spring outfits".into()),
            user_topic: None,
            user_style: Some("casual".into()),
            user_target_audience: None,
            interaction_note_count: 4,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"task_type\":\"social-account-operator\""));
        let back: AgentParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn missing_note_count_defaults() {
        let back: AgentParams =
            serde_json::from_str(r#"{"task_type":"social-account-operator"}"#).unwrap();
        let AgentParams::SocialOperator {
            interaction_note_count,
            ..
        } = back;
        assert_eq!(interaction_note_count, 3);
    }
}
