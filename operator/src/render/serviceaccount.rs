//! Worker ServiceAccount rendering.

use super::agent_labels;
use crate::crds::Agent;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::ResourceExt;
use serde_json::json;

/// Render a minimal ServiceAccount for a worker. Workers get no special
/// permissions; pods disable token automount.
pub fn worker_service_account(agent: &Agent) -> Result<ServiceAccount, serde_json::Error> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {
            "name": agent.name_any(),
            "namespace": agent.namespace(),
            "labels": agent_labels(agent),
        }
    }))
}
