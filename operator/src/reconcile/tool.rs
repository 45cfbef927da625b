//! Tool reconciler: validates the bundle and advertises its functions.

use super::types::{Context, Result};
use crate::crds::{upsert_condition, Condition, Tool, ToolStatus};
use crate::metrics::{CONTROLLER_TOOL, RESULT_ERROR, RESULT_REQUEUE, RESULT_SUCCESS};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

#[instrument(skip(ctx), fields(tool = %tool.name_any()))]
pub async fn reconcile_tool(tool: Arc<Tool>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = tool.name_any();
    let namespace = tool.namespace().unwrap_or_default();
    debug!("Reconciling Tool {namespace}/{name}");

    let generation = tool.metadata.generation;
    let mut status = tool.status.clone().unwrap_or_default();

    if tool.spec.image.is_empty() {
        status.ready = false;
        status.available_tools.clear();
        status.observed_generation = generation;
        upsert_condition(
            &mut status.conditions,
            Condition::ready(false, "ValidationFailed", "spec.image is required", generation),
        );
        // Validation errors are not retried until the spec changes
        return match update_status(&tool, &ctx, &status).await {
            Ok(()) => {
                ctx.metrics.set_tool_metrics(&name, &namespace, false, 0);
                ctx.metrics.record_reconcile(
                    CONTROLLER_TOOL,
                    RESULT_ERROR,
                    start.elapsed().as_secs_f64(),
                );
                ctx.metrics.record_reconcile_error(CONTROLLER_TOOL, "validation");
                Ok(Action::await_change())
            }
            Err(e) if e.is_conflict() => {
                ctx.metrics.record_reconcile(
                    CONTROLLER_TOOL,
                    RESULT_REQUEUE,
                    start.elapsed().as_secs_f64(),
                );
                Ok(Action::requeue(std::time::Duration::from_secs(1)))
            }
            Err(e) => Err(e),
        };
    }

    status.ready = true;
    status.available_tools = tool.spec.tools.clone();
    status.observed_generation = generation;
    upsert_condition(
        &mut status.conditions,
        Condition::ready(true, "Validated", "Tool is valid and ready", generation),
    );

    match update_status(&tool, &ctx, &status).await {
        Ok(()) => {}
        Err(e) if e.is_conflict() => {
            ctx.metrics.record_reconcile(
                CONTROLLER_TOOL,
                RESULT_REQUEUE,
                start.elapsed().as_secs_f64(),
            );
            return Ok(Action::requeue(std::time::Duration::from_secs(1)));
        }
        Err(e) => {
            ctx.metrics.record_reconcile_error(CONTROLLER_TOOL, "status_update");
            return Err(e);
        }
    }

    ctx.metrics
        .set_tool_metrics(&name, &namespace, true, status.available_tools.len());
    ctx.metrics
        .record_reconcile(CONTROLLER_TOOL, RESULT_SUCCESS, start.elapsed().as_secs_f64());
    info!(
        "Tool {namespace}/{name} reconciled ({} functions)",
        status.available_tools.len()
    );
    Ok(Action::await_change())
}

async fn update_status(tool: &Tool, ctx: &Context, status: &ToolStatus) -> Result<()> {
    let namespace = tool.namespace().unwrap_or_default();
    let api: Api<Tool> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &tool.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({"status": status})),
    )
    .await?;
    Ok(())
}
