//! Worker configuration blob rendering.
//!
//! The configuration is serialized with stable field order and two-space
//! indentation so that byte-identical inputs always produce byte-identical
//! output (and therefore an identical config hash).

use super::{agent_labels, WORKER_CONFIG_FILE};
use crate::crds::{Agent, AgentPolicy, NetworkSpec};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

/// Resolved information about a referenced Tool.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ToolPackageInfo {
    pub name: String,
    pub namespace: String,
    pub image: String,
    #[serde(rename = "entryModule", skip_serializing_if = "Option::is_none")]
    pub entry_module: Option<String>,
    #[serde(rename = "enabledTools", skip_serializing_if = "Vec::is_empty")]
    pub enabled_tools: Vec<String>,
    #[serde(rename = "disabledTools", skip_serializing_if = "Vec::is_empty")]
    pub disabled_tools: Vec<String>,
}

/// Runtime configuration handed to the worker process.
#[derive(Serialize, Debug)]
pub struct WorkerConfig {
    pub prompt: String,
    pub model: WorkerModelConfig,
    #[serde(rename = "toolPackages", skip_serializing_if = "Vec::is_empty")]
    pub tool_packages: Vec<ToolPackageInfo>,
    pub policy: WorkerPolicyConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<WorkerNetworkConfig>,
}

#[derive(Serialize, Debug)]
pub struct WorkerModelConfig {
    pub provider: String,
    #[serde(rename = "modelId")]
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct WorkerPolicyConfig {
    #[serde(rename = "maxToolCalls")]
    pub max_tool_calls: i32,
    #[serde(rename = "requestTimeoutSeconds")]
    pub request_timeout_seconds: i32,
    #[serde(rename = "toolTimeoutSeconds")]
    pub tool_timeout_seconds: i32,
    #[serde(rename = "maxConcurrentRequests")]
    pub max_concurrent_requests: i32,
}

#[derive(Serialize, Debug)]
pub struct WorkerNetworkConfig {
    #[serde(rename = "allowedFqdns", skip_serializing_if = "Vec::is_empty")]
    pub allowed_fqdns: Vec<String>,
    #[serde(rename = "allowedCidrs", skip_serializing_if = "Vec::is_empty")]
    pub allowed_cidrs: Vec<String>,
    #[serde(rename = "allowModelProvider")]
    pub allow_model_provider: bool,
}

/// Build the worker configuration value for an agent.
pub fn worker_config(agent: &Agent, tool_packages: &[ToolPackageInfo]) -> WorkerConfig {
    let policy = agent.spec.policy.clone().unwrap_or_default();

    WorkerConfig {
        prompt: agent.spec.prompt.clone(),
        model: WorkerModelConfig {
            provider: agent.spec.model.provider.clone(),
            model_id: agent.spec.model.model_id.clone(),
            temperature: agent.spec.model.temperature,
            max_tokens: agent.spec.model.max_tokens,
            endpoint: agent.spec.model.endpoint.clone(),
        },
        tool_packages: tool_packages.to_vec(),
        policy: policy_config(&policy),
        network: agent.spec.network.as_ref().map(network_config),
    }
}

fn policy_config(policy: &AgentPolicy) -> WorkerPolicyConfig {
    WorkerPolicyConfig {
        max_tool_calls: policy.max_tool_calls,
        request_timeout_seconds: duration_seconds(&policy.request_timeout, 300),
        tool_timeout_seconds: duration_seconds(&policy.tool_timeout, 30),
        max_concurrent_requests: policy.max_concurrent,
    }
}

fn network_config(network: &NetworkSpec) -> WorkerNetworkConfig {
    WorkerNetworkConfig {
        allowed_fqdns: network.allowed_fqdns.clone(),
        allowed_cidrs: network.allowed_cidrs.clone(),
        allow_model_provider: network.allow_model_provider,
    }
}

fn duration_seconds(raw: &str, default: u64) -> i32 {
    let d = humantime::parse_duration(raw).unwrap_or(Duration::from_secs(default));
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX)
}

/// Render the worker ConfigMap and the serialized configuration bytes the
/// config hash is computed from.
pub fn worker_config_map(
    agent: &Agent,
    tool_packages: &[ToolPackageInfo],
) -> Result<(ConfigMap, Vec<u8>), serde_json::Error> {
    let config = worker_config(agent, tool_packages);
    let config_json = serde_json::to_string_pretty(&config)?;

    let cm: ConfigMap = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": format!("{}-config", agent.name_any()),
            "namespace": agent.namespace(),
            "labels": agent_labels(agent),
        },
        "data": {
            WORKER_CONFIG_FILE: config_json,
        }
    }))?;

    Ok((cm, config_json.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AgentSpec, ModelConfig};

    fn sample_agent(prompt: &str) -> Agent {
        let mut agent = Agent::new(
            "alpha",
            AgentSpec {
                prompt: prompt.to_string(),
                model: ModelConfig {
                    provider: "anthropic".to_string(),
                    model_id: "claude-sonnet-4-20250514".to_string(),
                    temperature: None,
                    max_tokens: None,
                    endpoint: None,
                },
                tool_refs: Vec::new(),
                policy: None,
                network: None,
                replicas: 1,
                resources: None,
                image: None,
                service_account_name: None,
                env: Default::default(),
                env_from_secrets: Vec::new(),
                env_from: Vec::new(),
                node_selector: Default::default(),
                tools: Vec::new(),
            },
        );
        agent.metadata.namespace = Some("agents".to_string());
        agent
    }

    #[test]
    fn test_worker_config_map_is_byte_stable() {
        let agent = sample_agent("You are a cost analyst.");
        let (_, first) = worker_config_map(&agent, &[]).unwrap();
        let (_, second) = worker_config_map(&agent, &[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_worker_config_map_changes_with_prompt() {
        let a = sample_agent("A");
        let b = sample_agent("B");
        let (_, bytes_a) = worker_config_map(&a, &[]).unwrap();
        let (_, bytes_b) = worker_config_map(&b, &[]).unwrap();
        assert_ne!(bytes_a, bytes_b);
    }

    #[test]
    fn test_worker_config_policy_defaults() {
        let agent = sample_agent("x");
        let config = worker_config(&agent, &[]);
        assert_eq!(config.policy.max_tool_calls, 50);
        assert_eq!(config.policy.request_timeout_seconds, 300);
        assert_eq!(config.policy.tool_timeout_seconds, 30);
        assert_eq!(config.policy.max_concurrent_requests, 10);
    }
}
