//! Worker Service rendering.

use super::{agent_labels, WORKER_PORT};
use crate::crds::Agent;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde_json::json;

/// Render the ClusterIP Service fronting a worker.
pub fn worker_service(agent: &Agent) -> Result<Service, serde_json::Error> {
    let labels = agent_labels(agent);

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": agent.name_any(),
            "namespace": agent.namespace(),
            "labels": labels,
        },
        "spec": {
            "type": "ClusterIP",
            "selector": labels,
            "ports": [
                {"name": "http", "port": WORKER_PORT, "targetPort": WORKER_PORT, "protocol": "TCP"},
            ],
        }
    }))
}

/// Fully qualified in-cluster endpoint for a worker service.
pub fn worker_endpoint(agent: &Agent) -> String {
    format!(
        "{}.{}.svc.cluster.local:{WORKER_PORT}",
        agent.name_any(),
        agent.namespace().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AgentSpec, ModelConfig};

    #[test]
    fn test_worker_endpoint_format() {
        let mut agent = Agent::new(
            "alpha",
            AgentSpec {
                prompt: "p".to_string(),
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

        assert_eq!(worker_endpoint(&agent), "alpha.agents.svc.cluster.local:8080");
    }
}
