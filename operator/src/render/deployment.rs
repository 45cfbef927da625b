//! Worker Deployment rendering.

use super::{
    agent_labels, agent_pod_labels, ToolPackageInfo, CONFIG_HASH_ANNOTATION,
    DEFAULT_WORKER_IMAGE, WORKER_CONFIG_FILE, WORKER_CONFIG_MOUNT_PATH, WORKER_LIBS_IMAGE,
    WORKER_PORT,
};
use crate::crds::Agent;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use serde_json::{json, Value};

/// Parameters for rendering a worker Deployment.
pub struct WorkerDeploymentParams<'a> {
    pub agent: &'a Agent,
    pub config_map_name: String,
    pub config_hash: String,
    pub tool_packages: &'a [ToolPackageInfo],
}

/// Render the Deployment for a worker.
///
/// The config hash is stamped as a pod-template annotation so the
/// orchestrator's own rolling-update logic replaces pods when the rendered
/// configuration changes.
pub fn worker_deployment(params: WorkerDeploymentParams<'_>) -> Result<Deployment, serde_json::Error> {
    let agent = params.agent;
    let name = agent.name_any();
    let namespace = agent.namespace().unwrap_or_default();

    let image = agent
        .spec
        .image
        .clone()
        .unwrap_or_else(|| DEFAULT_WORKER_IMAGE.to_string());

    let selector_labels = agent_labels(agent);
    let pod_labels = agent_pod_labels(agent);

    let service_account = agent
        .spec
        .service_account_name
        .clone()
        .unwrap_or_else(|| name.clone());

    let mut container = json!({
        "name": "agent",
        "image": image,
        "imagePullPolicy": "IfNotPresent",
        "ports": [
            {"name": "http", "containerPort": WORKER_PORT, "protocol": "TCP"},
        ],
        "env": build_env(agent),
        "volumeMounts": [
            {"name": "config", "mountPath": WORKER_CONFIG_MOUNT_PATH, "readOnly": true},
            {"name": "tools", "mountPath": "/tools", "readOnly": true},
            {"name": "tmp", "mountPath": "/tmp"},
        ],
        "securityContext": container_security_context(),
        "readinessProbe": {
            "httpGet": {"path": "/healthz", "port": WORKER_PORT},
            "initialDelaySeconds": 5,
            "periodSeconds": 10,
        },
        "livenessProbe": {
            "httpGet": {"path": "/healthz", "port": WORKER_PORT},
            "initialDelaySeconds": 15,
            "periodSeconds": 20,
        },
    });

    if !agent.spec.env_from.is_empty() {
        let env_from: Vec<Value> = agent
            .spec
            .env_from
            .iter()
            .filter_map(|src| {
                if let Some(secret) = &src.secret_ref {
                    Some(json!({"secretRef": {"name": secret}}))
                } else {
                    src.config_map_ref
                        .as_ref()
                        .map(|cm| json!({"configMapRef": {"name": cm}}))
                }
            })
            .collect();
        container["envFrom"] = Value::Array(env_from);
    }

    if let Some(resources) = &agent.spec.resources {
        container["resources"] = json!({
            "requests": resources.requests,
            "limits": resources.limits,
        });
    }

    let mut pod_spec = json!({
        "serviceAccountName": service_account,
        "automountServiceAccountToken": false,
        "dnsPolicy": "ClusterFirst",
        "securityContext": pod_security_context(),
        "initContainers": build_tool_init_containers(params.tool_packages),
        "containers": [container],
        "volumes": [
            {"name": "config", "configMap": {"name": params.config_map_name}},
            {"name": "tools", "emptyDir": {}},
            {"name": "tmp", "emptyDir": {}},
        ],
    });

    if !agent.spec.node_selector.is_empty() {
        pod_spec["nodeSelector"] = json!(agent.spec.node_selector);
    }

    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": selector_labels,
        },
        "spec": {
            "replicas": agent.spec.replicas,
            "selector": {"matchLabels": selector_labels},
            "template": {
                "metadata": {
                    "labels": pod_labels,
                    "annotations": {CONFIG_HASH_ANNOTATION: params.config_hash},
                },
                "spec": pod_spec,
            },
        }
    }))
}

/// Worker container env: the config path, tool import path, then spec env
/// in sorted order so repeated renders diff clean.
fn build_env(agent: &Agent) -> Vec<Value> {
    let mut env = vec![
        json!({
            "name": "AGENT_CONFIG_PATH",
            "value": format!("{WORKER_CONFIG_MOUNT_PATH}/{WORKER_CONFIG_FILE}"),
        }),
        json!({"name": "PYTHONPATH", "value": "/tools"}),
    ];

    let mut keys: Vec<&String> = agent.spec.env.keys().collect();
    keys.sort();
    for key in keys {
        env.push(json!({"name": key, "value": agent.spec.env[key]}));
    }

    for secret_env in &agent.spec.env_from_secrets {
        env.push(json!({
            "name": secret_env.name,
            "valueFrom": {
                "secretKeyRef": {
                    "name": secret_env.secret_name,
                    "key": secret_env.secret_key,
                }
            }
        }));
    }

    env
}

/// One init container per Tool copies its files into the shared volume.
/// The shared libs image always runs first.
fn build_tool_init_containers(tool_packages: &[ToolPackageInfo]) -> Vec<Value> {
    let mut containers = vec![json!({
        "name": "agent-libs",
        "image": WORKER_LIBS_IMAGE,
        "imagePullPolicy": "IfNotPresent",
        "command": ["sh", "-c", "cp -r /app/* /tools/"],
        "volumeMounts": [{"name": "tools", "mountPath": "/tools"}],
        "securityContext": container_security_context(),
    })];

    for (i, tp) in tool_packages.iter().enumerate() {
        containers.push(json!({
            "name": format!("toolpkg-{i}"),
            "image": tp.image,
            "imagePullPolicy": "IfNotPresent",
            "command": ["sh", "-c", "cp -r /app/* /tools/"],
            "volumeMounts": [{"name": "tools", "mountPath": "/tools"}],
            "securityContext": container_security_context(),
        }));
    }

    containers
}

pub(super) fn pod_security_context() -> Value {
    json!({
        "runAsNonRoot": true,
        "seccompProfile": {"type": "RuntimeDefault"},
    })
}

pub(super) fn container_security_context() -> Value {
    json!({
        "allowPrivilegeEscalation": false,
        "readOnlyRootFilesystem": true,
        "runAsNonRoot": true,
        "capabilities": {"drop": ["ALL"]},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AgentSpec, ModelConfig};

    fn sample_agent() -> Agent {
        let mut agent = Agent::new(
            "alpha",
            AgentSpec {
                prompt: "You are a test agent.".to_string(),
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
                replicas: 2,
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
    fn test_worker_deployment_carries_config_hash_annotation() {
        let agent = sample_agent();
        let deployment = worker_deployment(WorkerDeploymentParams {
            agent: &agent,
            config_map_name: "alpha-config".to_string(),
            config_hash: "0011223344556677".to_string(),
            tool_packages: &[],
        })
        .unwrap();

        let annotations = deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap();
        assert_eq!(
            annotations.get(CONFIG_HASH_ANNOTATION).map(String::as_str),
            Some("0011223344556677")
        );
    }

    #[test]
    fn test_worker_deployment_replicas_and_selector() {
        let agent = sample_agent();
        let deployment = worker_deployment(WorkerDeploymentParams {
            agent: &agent,
            config_map_name: "alpha-config".to_string(),
            config_hash: "deadbeefdeadbeef".to_string(),
            tool_packages: &[],
        })
        .unwrap();

        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.selector
                .match_labels
                .as_ref()
                .unwrap()
                .get("agentmesh.dev/agent")
                .map(String::as_str),
            Some("alpha")
        );
    }

    #[test]
    fn test_tool_init_containers_follow_shared_libs() {
        let tp = ToolPackageInfo {
            name: "string-tools".to_string(),
            namespace: "agents".to_string(),
            image: "ghcr.io/acme/string-tools:1".to_string(),
            entry_module: None,
            enabled_tools: Vec::new(),
            disabled_tools: Vec::new(),
        };
        let containers = build_tool_init_containers(std::slice::from_ref(&tp));
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0]["name"], "agent-libs");
        assert_eq!(containers[1]["name"], "toolpkg-0");
        assert_eq!(containers[1]["image"], "ghcr.io/acme/string-tools:1");
    }
}
