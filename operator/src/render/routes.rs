//! Compiled route table rendering.
//!
//! The table is the only data surface the gateway reads. Emission is
//! deterministic: identical inputs produce byte-identical JSON so the
//! gateway never reloads for a no-op edit.

use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Name of the ConfigMap the gateway mounts.
pub const GATEWAY_ROUTES_CONFIGMAP: &str = "agentmesh-gateway-routes";

/// Key inside the ConfigMap holding the table.
pub const GATEWAY_ROUTES_KEY: &str = "routes.json";

/// The compiled routing table consumed by the gateway.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RouteTable {
    /// Rules in priority-descending order, ties keep spec order
    pub rules: Vec<CompiledRule>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<RouteDefaultConfig>,
}

/// A pre-compiled route rule.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompiledRule {
    pub name: String,
    pub priority: i32,
    #[serde(rename = "match")]
    pub match_: CompiledMatch,
    pub backends: Vec<CompiledBackend>,
}

/// Match criteria of a compiled rule. Omitted fields are absent in the
/// blob; the consumer supplies defaults.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CompiledMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    #[serde(
        default,
        rename = "intentRegex",
        skip_serializing_if = "Option::is_none"
    )]
    pub intent_regex: Option<String>,

    #[serde(default, rename = "tenantId", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// A backend resolved to its endpoint and readiness.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompiledBackend {
    #[serde(rename = "agentName")]
    pub agent_name: String,
    pub namespace: String,
    pub endpoint: String,
    pub weight: i32,
    pub ready: bool,
}

/// Default routing configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RouteDefaultConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<CompiledBackend>,

    #[serde(rename = "maxConcurrent")]
    pub max_concurrent: i32,

    #[serde(rename = "maxQueueSize")]
    pub max_queue_size: i32,

    #[serde(rename = "queueTimeoutMs")]
    pub queue_timeout_ms: i64,

    #[serde(rename = "requestTimeoutMs")]
    pub request_timeout_ms: i64,

    #[serde(rename = "rejectUnmatched")]
    pub reject_unmatched: bool,
}

impl Default for RouteDefaultConfig {
    fn default() -> Self {
        Self {
            backend: None,
            max_concurrent: 100,
            max_queue_size: 50,
            queue_timeout_ms: 30_000,
            request_timeout_ms: 300_000,
            reject_unmatched: false,
        }
    }
}

/// Render the gateway routes ConfigMap from a compiled table.
pub fn gateway_routes_config_map(
    namespace: &str,
    table: &RouteTable,
) -> Result<ConfigMap, serde_json::Error> {
    let table_json = serde_json::to_string_pretty(table)?;

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": GATEWAY_ROUTES_CONFIGMAP,
            "namespace": namespace,
            "labels": {
                "app.kubernetes.io/name": "agentmesh-gateway",
                "app.kubernetes.io/component": "routes",
                "app.kubernetes.io/managed-by": "agentmesh-operator",
            },
        },
        "data": {
            GATEWAY_ROUTES_KEY: table_json,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, ready: bool) -> CompiledBackend {
        CompiledBackend {
            agent_name: name.to_string(),
            namespace: "agents".to_string(),
            endpoint: format!("{name}.agents.svc.cluster.local:8080"),
            weight: 100,
            ready,
        }
    }

    #[test]
    fn test_route_table_emission_is_byte_identical() {
        let table = RouteTable {
            rules: vec![CompiledRule {
                name: "r".to_string(),
                priority: 10,
                match_: CompiledMatch {
                    agent: Some("alpha".to_string()),
                    ..Default::default()
                },
                backends: vec![backend("alpha", true)],
            }],
            defaults: Some(RouteDefaultConfig::default()),
        };

        let a = serde_json::to_string_pretty(&table).unwrap();
        let b = serde_json::to_string_pretty(&table).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_match_fields_are_omitted() {
        let rule = CompiledRule {
            name: "r".to_string(),
            priority: 0,
            match_: CompiledMatch::default(),
            backends: vec![backend("alpha", true)],
        };
        let raw = serde_json::to_string(&rule).unwrap();
        assert!(!raw.contains("intentRegex"));
        assert!(!raw.contains("tenantId"));
        assert!(!raw.contains("headers"));
    }

    #[test]
    fn test_gateway_routes_config_map_name_and_key() {
        let cm = gateway_routes_config_map("agentmesh-gateway", &RouteTable::default()).unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some(GATEWAY_ROUTES_CONFIGMAP));
        assert!(cm.data.unwrap().contains_key(GATEWAY_ROUTES_KEY));
    }
}
