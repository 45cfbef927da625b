//! `Route` Custom Resource Definition mapping requests to agents

use super::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to an Agent resource.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct AgentRef {
    /// Name of the Agent
    pub name: String,

    /// Namespace of the Agent (defaults to the route namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A weighted target agent for a rule.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct RouteBackend {
    /// Target agent
    #[serde(rename = "agentRef")]
    pub agent_ref: AgentRef,

    /// Selection probability in [0, 100]; defaults to 100 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

/// Matching criteria for a rule. All non-empty criteria must hold.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct RouteMatch {
    /// Explicit agent name in the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Regex applied to the request intent
    #[serde(
        default,
        rename = "intentRegex",
        skip_serializing_if = "Option::is_none"
    )]
    pub intent_regex: Option<String>,

    /// Tenant the request must originate from
    #[serde(default, rename = "tenantId", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Request headers that must match exactly
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// A single routing rule.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct RouteRule {
    /// Unique identifier for this rule
    pub name: String,

    /// Evaluation order; higher evaluates first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Conditions for this rule
    #[serde(rename = "match")]
    pub match_: RouteMatch,

    /// Weighted target agents
    pub backends: Vec<RouteBackend>,
}

/// Per-route admission limits handed to the gateway.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct CircuitBreakerConfig {
    /// Concurrent in-flight requests per rule
    #[serde(
        default,
        rename = "maxConcurrent",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_concurrent: Option<i32>,

    /// Queued requests allowed when at capacity
    #[serde(
        default,
        rename = "maxQueueSize",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_queue_size: Option<i32>,

    /// How long a request may wait in queue (humantime string)
    #[serde(
        default,
        rename = "queueTimeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub queue_timeout: Option<String>,

    /// Maximum downstream request duration (humantime string)
    #[serde(
        default,
        rename = "requestTimeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_timeout: Option<String>,
}

/// Fallback behavior when no rule matches.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct RouteDefaults {
    /// Fallback agent for unmatched requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<RouteBackend>,

    /// Admission limits
    #[serde(
        default,
        rename = "circuitBreaker",
        skip_serializing_if = "Option::is_none"
    )]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Reject unmatched requests instead of returning not-found
    #[serde(
        default,
        rename = "rejectUnmatched",
        skip_serializing_if = "Option::is_none"
    )]
    pub reject_unmatched: Option<bool>,
}

/// `Route` CRD declaring request-to-agent mapping rules.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agentmesh.dev", version = "v1alpha1", kind = "Route")]
#[kube(namespaced)]
#[kube(status = "RouteStatus")]
#[kube(shortname = "rt")]
#[kube(printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#)]
#[kube(printcolumn = r#"{"name":"Rules","type":"integer","jsonPath":".status.activeRules"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct RouteSpec {
    /// Routing rules, evaluated in priority order
    #[serde(default)]
    pub rules: Vec<RouteRule>,

    /// Fallback behavior
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<RouteDefaults>,
}

/// Resolved health of a referenced agent.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct RouteBackendStatus {
    /// The referenced agent
    #[serde(rename = "agentRef")]
    pub agent_ref: AgentRef,

    /// Agent is ready to serve
    pub ready: bool,

    /// Resolved service endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Status of the `Route`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct RouteStatus {
    /// All referenced agents are ready and all rules compiled
    #[serde(default)]
    pub ready: bool,

    /// Last observed generation
    #[serde(default, rename = "observedGeneration")]
    pub observed_generation: Option<i64>,

    /// Number of compiled rules
    #[serde(default, rename = "activeRules")]
    pub active_rules: i32,

    /// Health of every referenced agent
    #[serde(default)]
    pub backends: Vec<RouteBackendStatus>,

    /// Name of the generated routes ConfigMap
    #[serde(default, rename = "compiledConfigMap")]
    pub compiled_config_map: Option<String>,

    /// Latest observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
