//! `Agent` Custom Resource Definition for deployable AI workers

use super::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Default function for `replicas` field
fn default_replicas() -> i32 {
    1
}

/// Default function for `max_tool_calls` field
fn default_max_tool_calls() -> i32 {
    50
}

fn default_request_timeout() -> String {
    "5m".to_string()
}

fn default_tool_timeout() -> String {
    "30s".to_string()
}

fn default_max_concurrent() -> i32 {
    10
}

fn default_allow_model_provider() -> bool {
    true
}

/// LLM backend configuration for a worker.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct ModelConfig {
    /// Model provider (e.g. "anthropic", "openai", "bedrock")
    pub provider: String,

    /// Model identifier (e.g. "claude-sonnet-4-20250514")
    #[serde(rename = "modelId")]
    pub model_id: String,

    /// Sampling temperature (0.0-1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Maximum output tokens
    #[serde(default, rename = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,

    /// Override for the provider endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Reference to a Tool resource, optionally narrowing its function list.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct ToolRef {
    /// Name of the Tool
    pub name: String,

    /// Namespace of the Tool (defaults to the agent namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Specific functions to enable (empty means all)
    #[serde(default)]
    pub enable: Vec<String>,

    /// Specific functions to disable
    #[serde(default)]
    pub disable: Vec<String>,
}

/// Runtime constraints enforced inside the worker.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct AgentPolicy {
    /// Maximum tool invocations per request
    #[serde(default = "default_max_tool_calls", rename = "maxToolCalls")]
    pub max_tool_calls: i32,

    /// Maximum duration for a single request (humantime string)
    #[serde(default = "default_request_timeout", rename = "requestTimeout")]
    pub request_timeout: String,

    /// Maximum duration for a single tool call (humantime string)
    #[serde(default = "default_tool_timeout", rename = "toolTimeout")]
    pub tool_timeout: String,

    /// Maximum parallel requests per worker
    #[serde(default = "default_max_concurrent", rename = "maxConcurrent")]
    pub max_concurrent: i32,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            request_timeout: default_request_timeout(),
            tool_timeout: default_tool_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Egress allow lists for the worker pod.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct NetworkSpec {
    /// FQDNs the worker may connect to
    #[serde(default, rename = "allowedFqdns")]
    pub allowed_fqdns: Vec<String>,

    /// CIDR blocks the worker may connect to
    #[serde(default, rename = "allowedCidrs")]
    pub allowed_cidrs: Vec<String>,

    /// Automatically allow egress to the model provider endpoint
    #[serde(
        default = "default_allow_model_provider",
        rename = "allowModelProvider"
    )]
    pub allow_model_provider: bool,
}

/// Compute resources for the worker container.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ResourceSpec {
    /// Resource requests (e.g. cpu: "100m", memory: "256Mi")
    #[serde(default)]
    pub requests: BTreeMap<String, String>,

    /// Resource limits
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Reference to a secret for a single environment variable.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct SecretEnvVar {
    /// Name of the environment variable
    pub name: String,
    /// Name of the secret
    #[serde(rename = "secretName")]
    pub secret_name: String,
    /// Key within the secret
    #[serde(rename = "secretKey")]
    pub secret_key: String,
}

/// Bulk environment source (entire Secret or ConfigMap).
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct EnvFromRef {
    /// Name of a Secret to load as environment variables
    #[serde(default, rename = "secretRef", skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,

    /// Name of a ConfigMap to load as environment variables
    #[serde(
        default,
        rename = "configMapRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub config_map_ref: Option<String>,
}

/// A callable function this worker advertises over MCP.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct AgentTool {
    /// Function identifier (e.g. "analyze_costs")
    pub name: String,

    /// What the function does
    #[serde(default)]
    pub description: String,

    /// JSON Schema for the function parameters
    #[serde(
        default,
        rename = "inputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<serde_json::Value>,
}

/// `Agent` CRD declaring a deployable AI worker.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agentmesh.dev", version = "v1alpha1", kind = "Agent")]
#[kube(namespaced)]
#[kube(status = "AgentStatus")]
#[kube(shortname = "ag")]
#[kube(printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#)]
#[kube(printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.availableReplicas"}"#)]
#[kube(printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.endpoint"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct AgentSpec {
    /// System instruction / persona for the worker
    pub prompt: String,

    /// LLM backend configuration
    pub model: ModelConfig,

    /// Tool bundles mounted into the worker
    #[serde(default, rename = "toolRefs")]
    pub tool_refs: Vec<ToolRef>,

    /// Runtime constraints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<AgentPolicy>,

    /// Egress allow lists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,

    /// Number of worker pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Compute resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    /// Override for the worker runner image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// ServiceAccount for the worker pods (a minimal one is created if unset)
    #[serde(
        default,
        rename = "serviceAccountName",
        skip_serializing_if = "Option::is_none"
    )]
    pub service_account_name: Option<String>,

    /// Environment variables set directly in the worker container
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Environment variables pulled from individual secret keys
    #[serde(default, rename = "envFromSecrets")]
    pub env_from_secrets: Vec<SecretEnvVar>,

    /// Bulk environment sources (whole Secrets / ConfigMaps)
    #[serde(default, rename = "envFrom")]
    pub env_from: Vec<EnvFromRef>,

    /// Node selector for pod scheduling
    #[serde(default, rename = "nodeSelector")]
    pub node_selector: BTreeMap<String, String>,

    /// Functions this worker advertises over MCP
    #[serde(default)]
    pub tools: Vec<AgentTool>,
}

/// Status of the `Agent`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct AgentStatus {
    /// Worker deployment is ready to serve requests
    #[serde(default)]
    pub ready: bool,

    /// Last observed generation
    #[serde(default, rename = "observedGeneration")]
    pub observed_generation: Option<i64>,

    /// Service endpoint (host:port), set only while ready.
    /// Serialized even when None so a status patch clears a stale value.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Number of ready worker pods
    #[serde(default, rename = "availableReplicas")]
    pub available_replicas: i32,

    /// Hash of the rendered worker configuration
    #[serde(default, rename = "configHash")]
    pub config_hash: Option<String>,

    /// Functions currently discoverable, mirrors spec.tools while ready
    #[serde(default, rename = "availableTools")]
    pub available_tools: Vec<AgentTool>,

    /// Latest observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_spec_defaults() {
        let spec: AgentSpec = serde_json::from_value(serde_json::json!({
            "prompt": "You are a cost analyst.",
            "model": {"provider": "anthropic", "modelId": "claude-sonnet-4-20250514"}
        }))
        .unwrap();

        assert_eq!(spec.replicas, 1);
        assert!(spec.tool_refs.is_empty());
        assert!(spec.policy.is_none());
        assert!(spec.tools.is_empty());
    }

    #[test]
    fn test_agent_policy_defaults() {
        let policy: AgentPolicy = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(policy.max_tool_calls, 50);
        assert_eq!(policy.request_timeout, "5m");
        assert_eq!(policy.tool_timeout, "30s");
        assert_eq!(policy.max_concurrent, 10);
    }
}
