//! `Tool` Custom Resource Definition for callable function bundles

use super::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

/// A single declared function inside a Tool bundle.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ToolDefinition {
    /// Function name (matches the decorated function in the bundle)
    pub name: String,

    /// What the function does
    #[serde(default)]
    pub description: String,

    /// JSON Schema for function input parameters
    #[serde(
        default,
        rename = "inputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<serde_json::Value>,

    /// JSON Schema for function output
    #[serde(
        default,
        rename = "outputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub output_schema: Option<serde_json::Value>,
}

/// `Tool` CRD declaring an OCI-packaged function bundle mountable into agents.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agentmesh.dev", version = "v1alpha1", kind = "Tool")]
#[kube(namespaced)]
#[kube(status = "ToolStatus")]
#[kube(shortname = "tl")]
#[kube(printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct ToolSpec {
    /// OCI image containing the function code
    pub image: String,

    /// When to pull the image
    #[serde(default = "default_pull_policy", rename = "pullPolicy")]
    pub pull_policy: String,

    /// Module path to import inside the bundle
    #[serde(
        default,
        rename = "entryModule",
        skip_serializing_if = "Option::is_none"
    )]
    pub entry_module: Option<String>,

    /// Declared functions in this bundle
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// Status of the `Tool`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ToolStatus {
    /// Tool is validated and usable by agents
    #[serde(default)]
    pub ready: bool,

    /// Last observed generation
    #[serde(default, rename = "observedGeneration")]
    pub observed_generation: Option<i64>,

    /// Advertised functions (copy of the declared list)
    #[serde(default, rename = "availableTools")]
    pub available_tools: Vec<ToolDefinition>,

    /// Latest observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
