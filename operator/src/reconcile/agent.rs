//! Agent reconciler: materializes worker pods, service and configuration,
//! and keeps status convergent with the observed deployment.

use super::types::{upsert, Context, Error, Result};
use crate::crds::{upsert_condition, Agent, AgentStatus, Condition, Tool};
use crate::metrics::{CONTROLLER_AGENT, RESULT_ERROR, RESULT_REQUEUE, RESULT_SUCCESS};
use crate::render;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const RESOLUTION_REQUEUE: Duration = Duration::from_secs(30);

#[instrument(skip(ctx), fields(agent = %agent.name_any()))]
pub async fn reconcile_agent(agent: Arc<Agent>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = agent.name_any();
    let namespace = agent.namespace().ok_or(Error::MissingObjectKey)?;
    debug!("Reconciling Agent {namespace}/{name}");

    let generation = agent.metadata.generation;
    let mut status = agent.status.clone().unwrap_or_default();

    // Resolve referenced tools; a missing or unready Tool blocks the agent.
    let tool_packages = match resolve_tool_packages(&agent, &namespace, &ctx).await {
        Ok(packages) => packages,
        Err(Error::ToolResolution(message)) => {
            warn!("Agent {namespace}/{name}: {message}");
            status.ready = false;
            status.endpoint = None;
            status.available_tools.clear();
            status.observed_generation = generation;
            upsert_condition(
                &mut status.conditions,
                Condition::ready(false, "ToolResolutionFailed", &message, generation),
            );
            return match update_status(&agent, &ctx, &status).await {
                Ok(()) => {
                    ctx.metrics.record_reconcile(
                        CONTROLLER_AGENT,
                        RESULT_ERROR,
                        start.elapsed().as_secs_f64(),
                    );
                    ctx.metrics
                        .record_reconcile_error(CONTROLLER_AGENT, "tool_resolution");
                    Ok(Action::requeue(RESOLUTION_REQUEUE))
                }
                Err(e) if e.is_conflict() => {
                    ctx.metrics.record_reconcile(
                        CONTROLLER_AGENT,
                        RESULT_REQUEUE,
                        start.elapsed().as_secs_f64(),
                    );
                    Ok(Action::requeue(Duration::from_secs(1)))
                }
                Err(e) => Err(e),
            };
        }
        Err(e) => return Err(e),
    };

    let owner_ref = agent
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey)?;

    // Render the configuration first: its hash drives the rolling update.
    let (mut config_map, config_bytes) = render::worker_config_map(&agent, &tool_packages)?;
    let config_hash = render::hash_config(&config_bytes);
    let config_map_name = config_map.metadata.name.clone().unwrap_or_default();

    // ServiceAccount (skipped when the spec names its own)
    if agent.spec.service_account_name.is_none() {
        let mut sa = render::worker_service_account(&agent)?;
        set_owner(&mut sa.metadata.owner_references, &owner_ref);
        let sa_api: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &namespace);
        upsert(&sa_api, &name, sa).await?;
    }

    set_owner(&mut config_map.metadata.owner_references, &owner_ref);
    let cm_api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    upsert(&cm_api, &config_map_name, config_map).await?;

    let mut deployment = render::worker_deployment(render::WorkerDeploymentParams {
        agent: agent.as_ref(),
        config_map_name,
        config_hash: config_hash.clone(),
        tool_packages: &tool_packages,
    })?;
    set_owner(&mut deployment.metadata.owner_references, &owner_ref);
    let deploy_api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    upsert(&deploy_api, &name, deployment).await?;

    let mut service = render::worker_service(&agent)?;
    set_owner(&mut service.metadata.owner_references, &owner_ref);
    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    upsert_service(&svc_api, &name, service).await?;

    // Readiness: every desired replica available, and at least one.
    let (ready, available_replicas) = check_deployment_ready(&deploy_api, &agent, &name).await;

    status.ready = ready;
    status.available_replicas = available_replicas;
    status.config_hash = Some(config_hash);
    status.observed_generation = generation;
    status.endpoint = ready.then(|| render::worker_endpoint(&agent));
    status.available_tools = if ready {
        agent.spec.tools.clone()
    } else {
        Vec::new()
    };

    let condition = if ready {
        Condition::ready(true, "DeploymentReady", "Agent deployment is ready", generation)
    } else {
        Condition::ready(
            false,
            "DeploymentNotReady",
            "Agent deployment is not yet ready",
            generation,
        )
    };
    upsert_condition(&mut status.conditions, condition);

    match update_status(&agent, &ctx, &status).await {
        Ok(()) => {}
        Err(e) if e.is_conflict() => {
            debug!("Conflict updating Agent {namespace}/{name} status, requeueing");
            ctx.metrics.record_reconcile(
                CONTROLLER_AGENT,
                RESULT_REQUEUE,
                start.elapsed().as_secs_f64(),
            );
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        Err(e) => {
            ctx.metrics
                .record_reconcile_error(CONTROLLER_AGENT, "status_update");
            return Err(e);
        }
    }

    let image = agent
        .spec
        .image
        .clone()
        .unwrap_or_else(|| render::DEFAULT_WORKER_IMAGE.to_string());
    ctx.metrics.set_agent_metrics(
        &name,
        &namespace,
        &agent.spec.model.model_id,
        &image,
        ready,
        agent.spec.replicas,
        available_replicas,
        status.available_tools.len(),
    );
    ctx.metrics
        .record_reconcile(CONTROLLER_AGENT, RESULT_SUCCESS, start.elapsed().as_secs_f64());

    info!("Agent {namespace}/{name} reconciled (ready={ready})");

    // Not-ready deployments resolve via the owned-Deployment watch; a slow
    // requeue covers missed status transitions.
    if ready {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(15)))
    }
}

/// Resolve each toolRef to a ready Tool, carrying the enable/disable lists
/// through untouched.
async fn resolve_tool_packages(
    agent: &Agent,
    agent_namespace: &str,
    ctx: &Context,
) -> Result<Vec<render::ToolPackageInfo>> {
    let mut packages = Vec::with_capacity(agent.spec.tool_refs.len());

    for tool_ref in &agent.spec.tool_refs {
        let namespace = tool_ref
            .namespace
            .clone()
            .unwrap_or_else(|| agent_namespace.to_string());
        let api: Api<Tool> = Api::namespaced(ctx.client.clone(), &namespace);

        let tool = match api.get(&tool_ref.name).await {
            Ok(tool) => tool,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::ToolResolution(format!(
                    "Tool {namespace}/{} not found",
                    tool_ref.name
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !tool.status.as_ref().is_some_and(|s| s.ready) {
            return Err(Error::ToolResolution(format!(
                "Tool {namespace}/{} is not ready",
                tool_ref.name
            )));
        }

        packages.push(render::ToolPackageInfo {
            name: tool.name_any(),
            namespace,
            image: tool.spec.image.clone(),
            entry_module: tool.spec.entry_module.clone(),
            enabled_tools: tool_ref.enable.clone(),
            disabled_tools: tool_ref.disable.clone(),
        });
    }

    Ok(packages)
}

/// Services keep their allocated clusterIP across replaces.
async fn upsert_service(api: &Api<Service>, name: &str, mut desired: Service) -> Result<Service> {
    match api.create(&kube::api::PostParams::default(), &desired).await {
        Ok(created) => Ok(created),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            let existing = api.get(name).await?;
            desired.metadata.resource_version = existing.metadata.resource_version.clone();
            if let (Some(desired_spec), Some(existing_spec)) =
                (desired.spec.as_mut(), existing.spec.as_ref())
            {
                desired_spec.cluster_ip = existing_spec.cluster_ip.clone();
            }
            Ok(api
                .replace(name, &kube::api::PostParams::default(), &desired)
                .await?)
        }
        Err(e) => Err(e.into()),
    }
}

async fn check_deployment_ready(
    api: &Api<Deployment>,
    agent: &Agent,
    name: &str,
) -> (bool, i32) {
    let Ok(deployment) = api.get(name).await else {
        return (false, 0);
    };

    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let desired = agent.spec.replicas;

    (available >= desired && available > 0, available)
}

fn set_owner(refs: &mut Option<Vec<OwnerReference>>, owner: &OwnerReference) {
    *refs = Some(vec![owner.clone()]);
}

async fn update_status(agent: &Agent, ctx: &Context, status: &AgentStatus) -> Result<()> {
    let namespace = agent.namespace().unwrap_or_default();
    let api: Api<Agent> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &agent.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({"status": status})),
    )
    .await?;
    Ok(())
}
