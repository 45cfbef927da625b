//! Route reconciler: resolves backends against Agent status, compiles the
//! routing table and publishes it for the gateway.

use super::types::{upsert, Context, Error, Result};
use crate::crds::{
    upsert_condition, AgentRef, Condition, Route, RouteBackendStatus, RouteStatus,
};
use crate::crds::Agent;
use crate::metrics::{CONTROLLER_ROUTE, RESULT_ERROR, RESULT_REQUEUE, RESULT_SUCCESS};
use crate::render::{
    gateway_routes_config_map, CompiledBackend, CompiledMatch, CompiledRule, RouteDefaultConfig,
    RouteTable, GATEWAY_ROUTES_CONFIGMAP,
};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const DEFAULT_WEIGHT: i32 = 100;

#[instrument(skip(ctx), fields(route = %route.name_any()))]
pub async fn reconcile_route(route: Arc<Route>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = route.name_any();
    let namespace = route.namespace().ok_or(Error::MissingObjectKey)?;
    debug!("Reconciling Route {namespace}/{name}");

    let generation = route.metadata.generation;
    let mut status = route.status.clone().unwrap_or_default();

    // Resolve every referenced agent once, deduplicated by namespace/name.
    let (backends, all_ready) = resolve_backends(&route, &namespace, &ctx).await?;
    status.backends = backends.clone();
    status.active_rules = i32::try_from(route.spec.rules.len()).unwrap_or(i32::MAX);
    status.observed_generation = generation;

    // Compile; a syntactically invalid regex marks the route unready and
    // leaves the previously published table in place.
    let table = match compile_route_table(&route, &namespace, &backends) {
        Ok(table) => table,
        Err(message) => {
            warn!("Route {namespace}/{name}: {message}");
            status.ready = false;
            upsert_condition(
                &mut status.conditions,
                Condition::ready(false, "InvalidRegex", &message, generation),
            );
            return finish_status_update(&route, &ctx, &status, start, "invalid_regex").await;
        }
    };

    // Publish the compiled blob into the gateway namespace.
    let cm = gateway_routes_config_map(&ctx.gateway_namespace, &table)?;
    let cm_api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.gateway_namespace);
    if let Err(e) = upsert(&cm_api, GATEWAY_ROUTES_CONFIGMAP, cm).await {
        status.ready = false;
        upsert_condition(
            &mut status.conditions,
            Condition::ready(false, "ConfigMapUpdateFailed", &e.to_string(), generation),
        );
        let _ = update_status(&route, &ctx, &status).await;
        ctx.metrics
            .record_reconcile(CONTROLLER_ROUTE, RESULT_ERROR, start.elapsed().as_secs_f64());
        ctx.metrics
            .record_reconcile_error(CONTROLLER_ROUTE, "configmap_update");
        return Err(e);
    }

    status.compiled_config_map = Some(GATEWAY_ROUTES_CONFIGMAP.to_string());
    status.ready = all_ready;
    let condition = if all_ready {
        Condition::ready(true, "AllBackendsReady", "All backend agents are ready", generation)
    } else {
        Condition::ready(
            false,
            "BackendsNotReady",
            "Some backend agents are not ready",
            generation,
        )
    };
    upsert_condition(&mut status.conditions, condition);

    match update_status(&route, &ctx, &status).await {
        Ok(()) => {}
        Err(e) if e.is_conflict() => {
            debug!("Conflict updating Route {namespace}/{name} status, requeueing");
            ctx.metrics.record_reconcile(
                CONTROLLER_ROUTE,
                RESULT_REQUEUE,
                start.elapsed().as_secs_f64(),
            );
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        Err(e) => {
            ctx.metrics
                .record_reconcile_error(CONTROLLER_ROUTE, "status_update");
            return Err(e);
        }
    }

    let ready_backends = status.backends.iter().filter(|b| b.ready).count();
    ctx.metrics
        .set_route_metrics(&name, &namespace, status.active_rules, ready_backends);
    ctx.metrics
        .record_reconcile(CONTROLLER_ROUTE, RESULT_SUCCESS, start.elapsed().as_secs_f64());

    info!(
        "Route {namespace}/{name} reconciled (rules={}, ready={})",
        status.active_rules, status.ready
    );
    Ok(Action::await_change())
}

async fn finish_status_update(
    route: &Route,
    ctx: &Context,
    status: &RouteStatus,
    start: Instant,
    reason: &str,
) -> Result<Action> {
    match update_status(route, ctx, status).await {
        Ok(()) => {
            ctx.metrics
                .record_reconcile(CONTROLLER_ROUTE, RESULT_ERROR, start.elapsed().as_secs_f64());
            ctx.metrics.record_reconcile_error(CONTROLLER_ROUTE, reason);
            // Invalid specs are not retried until they change
            Ok(Action::await_change())
        }
        Err(e) if e.is_conflict() => {
            ctx.metrics.record_reconcile(
                CONTROLLER_ROUTE,
                RESULT_REQUEUE,
                start.elapsed().as_secs_f64(),
            );
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Err(e) => Err(e),
    }
}

/// Walk every backend reference once and read readiness/endpoint from the
/// referenced Agent status.
async fn resolve_backends(
    route: &Route,
    route_namespace: &str,
    ctx: &Context,
) -> Result<(Vec<RouteBackendStatus>, bool)> {
    let mut backends = Vec::new();
    let mut all_ready = true;
    let mut seen = HashSet::new();

    let mut refs: Vec<&AgentRef> = route
        .spec
        .rules
        .iter()
        .flat_map(|rule| rule.backends.iter().map(|b| &b.agent_ref))
        .collect();
    if let Some(default_backend) = route
        .spec
        .defaults
        .as_ref()
        .and_then(|d| d.backend.as_ref())
    {
        refs.push(&default_backend.agent_ref);
    }

    for agent_ref in refs {
        let namespace = agent_ref
            .namespace
            .clone()
            .unwrap_or_else(|| route_namespace.to_string());
        if !seen.insert(format!("{namespace}/{}", agent_ref.name)) {
            continue;
        }

        let api: Api<Agent> = Api::namespaced(ctx.client.clone(), &namespace);
        let mut backend = RouteBackendStatus {
            agent_ref: AgentRef {
                name: agent_ref.name.clone(),
                namespace: Some(namespace.clone()),
            },
            ready: false,
            endpoint: None,
        };

        match api.get(&agent_ref.name).await {
            Ok(agent) => {
                if let Some(agent_status) = &agent.status {
                    backend.ready = agent_status.ready;
                    backend.endpoint = agent_status.endpoint.clone();
                }
                if !backend.ready {
                    all_ready = false;
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                all_ready = false;
            }
            Err(e) => return Err(e.into()),
        }

        backends.push(backend);
    }

    Ok((backends, all_ready))
}

/// Compile a Route into the gateway-consumable table.
///
/// Rules are sorted by priority descending with ties keeping spec order;
/// weights default to 100; not-ready backends are included so the gateway
/// can observe recovery without a recompile. Returns an error message for
/// the first syntactically invalid intent regex.
pub fn compile_route_table(
    route: &Route,
    route_namespace: &str,
    backends: &[RouteBackendStatus],
) -> std::result::Result<RouteTable, String> {
    let mut backend_map: BTreeMap<String, &RouteBackendStatus> = BTreeMap::new();
    for backend in backends {
        let namespace = backend
            .agent_ref
            .namespace
            .clone()
            .unwrap_or_else(|| route_namespace.to_string());
        backend_map.insert(format!("{namespace}/{}", backend.agent_ref.name), backend);
    }

    let resolve = |agent_ref: &AgentRef, weight: Option<i32>| -> CompiledBackend {
        let namespace = agent_ref
            .namespace
            .clone()
            .unwrap_or_else(|| route_namespace.to_string());
        let resolved = backend_map.get(&format!("{namespace}/{}", agent_ref.name));
        CompiledBackend {
            agent_name: agent_ref.name.clone(),
            namespace,
            endpoint: resolved
                .and_then(|b| b.endpoint.clone())
                .unwrap_or_default(),
            weight: weight.unwrap_or(DEFAULT_WEIGHT),
            ready: resolved.is_some_and(|b| b.ready),
        }
    };

    let mut rules = Vec::with_capacity(route.spec.rules.len());
    for rule in &route.spec.rules {
        if let Some(pattern) = rule.match_.intent_regex.as_deref() {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(format!(
                    "rule {:?} has an invalid intentRegex {pattern:?}: {e}",
                    rule.name
                ));
            }
        }

        rules.push(CompiledRule {
            name: rule.name.clone(),
            priority: rule.priority.unwrap_or(0),
            match_: CompiledMatch {
                agent: rule.match_.agent.clone(),
                intent_regex: rule.match_.intent_regex.clone(),
                tenant_id: rule.match_.tenant_id.clone(),
                headers: rule.match_.headers.clone(),
            },
            backends: rule
                .backends
                .iter()
                .map(|b| resolve(&b.agent_ref, b.weight))
                .collect(),
        });
    }

    // Stable sort preserves spec order between equal priorities
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));

    let defaults = route.spec.defaults.as_ref().map(|defaults| {
        let mut config = RouteDefaultConfig::default();

        if let Some(cb) = &defaults.circuit_breaker {
            if let Some(max_concurrent) = cb.max_concurrent {
                config.max_concurrent = max_concurrent;
            }
            if let Some(max_queue_size) = cb.max_queue_size {
                config.max_queue_size = max_queue_size;
            }
            if let Some(queue_timeout) = cb.queue_timeout.as_deref() {
                if let Ok(d) = humantime::parse_duration(queue_timeout) {
                    config.queue_timeout_ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
                }
            }
            if let Some(request_timeout) = cb.request_timeout.as_deref() {
                if let Ok(d) = humantime::parse_duration(request_timeout) {
                    config.request_timeout_ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
                }
            }
        }

        if let Some(reject) = defaults.reject_unmatched {
            config.reject_unmatched = reject;
        }

        config.backend = defaults
            .backend
            .as_ref()
            .map(|b| resolve(&b.agent_ref, b.weight));

        config
    });

    Ok(RouteTable { rules, defaults })
}

async fn update_status(route: &Route, ctx: &Context, status: &RouteStatus) -> Result<()> {
    let namespace = route.namespace().unwrap_or_default();
    let api: Api<Route> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &route.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({"status": status})),
    )
    .await?;
    Ok(())
}

/// True when the route references the given agent (used by the cross-kind
/// watch to re-enqueue routes on agent changes).
pub fn route_references_agent(route: &Route, agent_name: &str, agent_namespace: &str) -> bool {
    let route_namespace = route.namespace().unwrap_or_default();
    let matches_ref = |agent_ref: &AgentRef| {
        let namespace = agent_ref.namespace.as_deref().unwrap_or(&route_namespace);
        agent_ref.name == agent_name && namespace == agent_namespace
    };

    route
        .spec
        .rules
        .iter()
        .any(|rule| rule.backends.iter().any(|b| matches_ref(&b.agent_ref)))
        || route
            .spec
            .defaults
            .as_ref()
            .and_then(|d| d.backend.as_ref())
            .is_some_and(|b| matches_ref(&b.agent_ref))
}
