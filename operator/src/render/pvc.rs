//! Task workspace PersistentVolumeClaim rendering.

use super::job::workspace_pvc_name;
use crate::crds::Task;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use serde_json::json;

/// Default workspace size.
const DEFAULT_WORKSPACE_SIZE: &str = "1Gi";

/// Render the workspace claim for a task. The workspace persists across
/// iterations so the orchestrator can work incrementally.
pub fn task_workspace_pvc(task: &Task) -> Result<PersistentVolumeClaim, serde_json::Error> {
    let name = task.name_any();

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": workspace_pvc_name(task),
            "namespace": task.namespace(),
            "labels": {
                "app.kubernetes.io/name": format!("{name}-workspace"),
                "app.kubernetes.io/component": "task-workspace",
                "app.kubernetes.io/managed-by": "agentmesh-operator",
                "agentmesh.dev/task": name,
            },
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": {
                "requests": {"storage": DEFAULT_WORKSPACE_SIZE},
            },
        }
    }))
}
