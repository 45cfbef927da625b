//! Custom Resource Definitions for the agentmesh control plane

mod agent;
mod route;
mod task;
mod tool;

pub use agent::{
    Agent, AgentPolicy, AgentSpec, AgentStatus, AgentTool, EnvFromRef, ModelConfig, NetworkSpec,
    ResourceSpec, SecretEnvVar, ToolRef,
};
pub use route::{
    AgentRef, CircuitBreakerConfig, Route, RouteBackend, RouteBackendStatus, RouteDefaults,
    RouteMatch, RouteRule, RouteSpec, RouteStatus,
};
pub use task::{
    GitConfig, IterationResult, QualityGate, Task, TaskLimits, TaskPhase, TaskSource,
    TaskSourceKeyRef, TaskSourceType, TaskSpec, TaskStatus,
};
pub use tool::{Tool, ToolDefinition, ToolSpec, ToolStatus};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for all agentmesh resources.
pub const API_GROUP: &str = "agentmesh.dev";

/// Condition attached to a resource status.
///
/// Exactly one entry per condition type is kept; `upsert_condition` updates
/// in place and only bumps the transition time when the status flips.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g. "Ready")
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition ("True" or "False")
    pub status: String,

    /// Machine-readable reason for the last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Generation observed when the condition was set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// RFC3339 time of the last status transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn ready(status: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self {
            condition_type: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: generation,
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        }
    }
}

/// Insert or update a condition by type.
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        if existing.status == condition.status {
            // Unchanged status keeps its original transition time
            condition.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_condition_replaces_same_type() {
        let mut conditions = Vec::new();
        upsert_condition(
            &mut conditions,
            Condition::ready(false, "DeploymentNotReady", "waiting", Some(1)),
        );
        upsert_condition(
            &mut conditions,
            Condition::ready(true, "DeploymentReady", "ready", Some(2)),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].reason, "DeploymentReady");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_upsert_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        let mut first = Condition::ready(true, "DeploymentReady", "ready", Some(1));
        first.last_transition_time = Some("2025-01-01T00:00:00+00:00".to_string());
        upsert_condition(&mut conditions, first);

        upsert_condition(
            &mut conditions,
            Condition::ready(true, "DeploymentReady", "still ready", Some(2)),
        );

        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2025-01-01T00:00:00+00:00")
        );
        assert_eq!(conditions[0].message, "still ready");
    }
}
