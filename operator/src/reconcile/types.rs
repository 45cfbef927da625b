//! Shared context and error types for the reconcilers.

use crate::metrics::ControllerMetrics;
use kube::api::{Api, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Finalizer gating Task cleanup.
pub const TASK_FINALIZER: &str = "agentmesh.dev/task-cleanup";

/// Annotation tracking how often a lost orchestration Job was recreated.
pub const JOB_RECREATIONS_ANNOTATION: &str = "agentmesh.dev/job-recreations";

/// Shared state handed to every reconciler.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    /// Namespace the compiled route table is published into
    pub gateway_namespace: String,
    pub metrics: Arc<ControllerMetrics>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("tool resolution failed: {0}")]
    ToolResolution(String),

    #[error("agent resolution failed: {0}")]
    AgentResolution(String),

    #[error("task source error: {0}")]
    TaskSource(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("object has no name")]
    MissingObjectKey,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True when a status update raced another writer; the caller should
    /// requeue silently instead of surfacing an error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}

/// Create the object, or replace it preserving the stored resourceVersion
/// when it already exists.
pub async fn upsert<K>(api: &Api<K>, name: &str, mut desired: K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), &desired).await {
        Ok(created) => Ok(created),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            let existing = api.get(name).await?;
            desired.meta_mut().resource_version = existing.meta().resource_version.clone();
            Ok(api.replace(name, &PostParams::default(), &desired).await?)
        }
        Err(e) => Err(e.into()),
    }
}
