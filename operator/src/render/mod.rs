//! Pure renderers producing Kubernetes object descriptors from declared
//! resources. No API calls happen here; reconcilers own all writes.

mod configmap;
mod deployment;
mod job;
mod pvc;
mod routes;
mod service;
mod serviceaccount;

pub use configmap::{worker_config, worker_config_map, ToolPackageInfo, WorkerConfig};
pub use deployment::{worker_deployment, WorkerDeploymentParams};
pub use job::{
    orchestrator_job, orchestrator_job_name, workspace_pvc_name, OrchestratorJobParams,
};
pub use pvc::task_workspace_pvc;
pub use routes::{
    gateway_routes_config_map, CompiledBackend, CompiledMatch, CompiledRule, RouteDefaultConfig,
    RouteTable, GATEWAY_ROUTES_CONFIGMAP, GATEWAY_ROUTES_KEY,
};
pub use service::{worker_endpoint, worker_service};
pub use serviceaccount::worker_service_account;

use crate::crds::Agent;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default worker runner image.
pub const DEFAULT_WORKER_IMAGE: &str = "ghcr.io/agentmesh/agent-runner:latest";

/// Shared worker libraries image, always copied in first.
pub const WORKER_LIBS_IMAGE: &str = "ghcr.io/agentmesh/agent-libs:latest";

/// Mount path for the worker configuration.
pub const WORKER_CONFIG_MOUNT_PATH: &str = "/etc/agent/config";

/// File name of the worker configuration inside its ConfigMap.
pub const WORKER_CONFIG_FILE: &str = "agent.json";

/// HTTP port every worker listens on.
pub const WORKER_PORT: i32 = 8080;

/// Default namespace the gateway runs in.
pub const GATEWAY_NAMESPACE: &str = "agentmesh-gateway";

/// Annotation carrying the rendered configuration hash.
pub const CONFIG_HASH_ANNOTATION: &str = "agentmesh.dev/config-hash";

/// Hash of rendered configuration content: first 8 bytes of SHA-256, hex.
/// Byte-identical input produces byte-identical output.
pub fn hash_config(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Standard labels for a worker's owned objects (also the selector).
pub fn agent_labels(agent: &Agent) -> BTreeMap<String, String> {
    let name = agent.name_any();
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), name.clone()),
        ("app.kubernetes.io/component".to_string(), "agent".to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "agentmesh-operator".to_string(),
        ),
        ("agentmesh.dev/agent".to_string(), name),
    ])
}

/// Pod labels add model metadata so scrapers can relabel by model.
pub fn agent_pod_labels(agent: &Agent) -> BTreeMap<String, String> {
    let mut labels = agent_labels(agent);
    labels.insert(
        "agentmesh.dev/provider".to_string(),
        agent.spec.model.provider.clone(),
    );
    labels.insert(
        "agentmesh.dev/model-id".to_string(),
        sanitize_label_value(&agent.spec.model.model_id),
    );
    labels.insert(
        "agentmesh.dev/prompt-hash".to_string(),
        hash_config(agent.spec.prompt.as_bytes()),
    );
    labels
}

/// Convert a string to a valid Kubernetes label value: at most 63 chars,
/// alphanumeric ends, only `[A-Za-z0-9-_.]` inside.
pub fn sanitize_label_value(s: &str) -> String {
    let mut out: Vec<u8> = s
        .bytes()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'.' {
                c
            } else {
                b'_'
            }
        })
        .collect();
    out.truncate(63);
    while out.first().is_some_and(|c| !c.is_ascii_alphanumeric()) {
        out.remove(0);
    }
    while out.last().is_some_and(|c| !c.is_ascii_alphanumeric()) {
        out.pop();
    }
    if out.is_empty() {
        return "unknown".to_string();
    }
    String::from_utf8(out).unwrap_or_else(|_| "unknown".to_string())
}

/// Parse a humantime duration string, falling back to a default.
pub fn parse_duration_or(s: Option<&str>, default: Duration) -> Duration {
    s.and_then(|raw| humantime::parse_duration(raw).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_config_is_deterministic() {
        let a = hash_config(b"{\"prompt\":\"A\"}");
        let b = hash_config(b"{\"prompt\":\"A\"}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_hash_config_changes_with_content() {
        assert_ne!(hash_config(b"{\"prompt\":\"A\"}"), hash_config(b"{\"prompt\":\"B\"}"));
    }

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("claude-sonnet-4"), "claude-sonnet-4");
        assert_eq!(sanitize_label_value("us.anthropic/claude:v1"), "us.anthropic_claude_v1");
        assert_eq!(sanitize_label_value("---"), "unknown");
        assert_eq!(sanitize_label_value("").len(), "unknown".len());

        let long = "a".repeat(100);
        assert_eq!(sanitize_label_value(&long).len(), 63);
    }

    #[test]
    fn test_parse_duration_or_falls_back() {
        assert_eq!(
            parse_duration_or(Some("30s"), Duration::from_secs(5)),
            Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration_or(Some("not a duration"), Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(parse_duration_or(None, Duration::from_secs(5)), Duration::from_secs(5));
    }
}
