//! The reconciliation engine: one controller loop per resource kind.
//!
//! Each kind runs an independent worker pool; reconciliations of the same
//! key are serialized by the runtime. The Route controller additionally
//! watches Agents and re-enqueues every Route referencing a changed one.

pub mod agent;
pub mod route;
pub mod task;
pub mod tool;
pub mod types;

pub use agent::reconcile_agent;
pub use route::{compile_route_table, reconcile_route, route_references_agent};
pub use task::{count_tasks_in_prd, parse_orchestrator_result, reconcile_task, OrchestratorResult};
pub use tool::reconcile_tool;
pub use types::{Context, Error, Result};

use crate::crds::{Agent, Route, Task, Tool};
use crate::metrics::ControllerMetrics;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service, ServiceAccount};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Event as WatchEvent};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Requeue delay applied by the error policies.
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Start all four controllers and run until shutdown.
#[instrument(skip_all)]
pub async fn run_controllers(
    client: Client,
    gateway_namespace: String,
    metrics: Arc<ControllerMetrics>,
) -> Result<()> {
    info!("Starting agentmesh controllers (gateway namespace: {gateway_namespace})");

    let context = Arc::new(Context {
        client: client.clone(),
        gateway_namespace,
        metrics: metrics.clone(),
    });

    // Controllers only see live objects; deletions are watched directly so
    // per-resource metric series go away with their resources.
    tokio::spawn(run_metrics_reaper(client.clone(), metrics));

    let tool_handle = tokio::spawn(run_tool_controller(client.clone(), context.clone()));
    let agent_handle = tokio::spawn(run_agent_controller(client.clone(), context.clone()));
    let route_handle = tokio::spawn(run_route_controller(client.clone(), context.clone()));
    let task_handle = tokio::spawn(run_task_controller(client, context));

    debug!("All controllers started");

    match tokio::try_join!(tool_handle, agent_handle, route_handle, task_handle) {
        Ok(_) => {}
        Err(e) => error!("Controller task join error: {e:?}"),
    }

    info!("Controllers shut down");
    Ok(())
}

async fn run_tool_controller(client: Client, context: Arc<Context>) {
    let tools: Api<Tool> = Api::all(client);
    let config = WatcherConfig::default().any_semantic();

    Controller::new(tools, config)
        .shutdown_on_signal()
        .run(reconcile_tool, error_policy_tool, context)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(resource = ?obj, "Tool reconciliation successful"),
                Err(e) => error!(error = ?e, "Tool reconciliation error"),
            }
        })
        .await;

    info!("Tool controller shutting down");
}

async fn run_agent_controller(client: Client, context: Arc<Context>) {
    let agents: Api<Agent> = Api::all(client.clone());
    let config = WatcherConfig::default().any_semantic();

    Controller::new(agents, config.clone())
        .owns(Api::<Deployment>::all(client.clone()), config.clone())
        .owns(Api::<Service>::all(client.clone()), config.clone())
        .owns(Api::<ConfigMap>::all(client.clone()), config.clone())
        .owns(Api::<ServiceAccount>::all(client), config)
        .shutdown_on_signal()
        .run(reconcile_agent, error_policy_agent, context)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(resource = ?obj, "Agent reconciliation successful"),
                Err(e) => error!(error = ?e, "Agent reconciliation error"),
            }
        })
        .await;

    info!("Agent controller shutting down");
}

async fn run_route_controller(client: Client, context: Arc<Context>) {
    let routes: Api<Route> = Api::all(client.clone());
    let config = WatcherConfig::default().any_semantic();

    let controller = Controller::new(routes, config.clone());

    // Agent changes re-enqueue every Route referencing that agent; the
    // mapping reads the controller's own reflector store.
    let store = controller.store();
    controller
        .watches(
            Api::<Agent>::all(client),
            config,
            move |agent: Agent| {
                let agent_name = agent.name_any();
                let agent_namespace = agent.namespace().unwrap_or_default();
                store
                    .state()
                    .iter()
                    .filter(|route| route_references_agent(route, &agent_name, &agent_namespace))
                    .map(|route| ObjectRef::from_obj(route.as_ref()))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(reconcile_route, error_policy_route, context)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(resource = ?obj, "Route reconciliation successful"),
                Err(e) => error!(error = ?e, "Route reconciliation error"),
            }
        })
        .await;

    info!("Route controller shutting down");
}

async fn run_task_controller(client: Client, context: Arc<Context>) {
    let tasks: Api<Task> = Api::all(client.clone());
    let config = WatcherConfig::default().any_semantic();

    Controller::new(tasks, config.clone())
        .owns(Api::<Job>::all(client.clone()), config.clone())
        .owns(Api::<PersistentVolumeClaim>::all(client), config)
        .shutdown_on_signal()
        .run(reconcile_task, error_policy_task, context)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(resource = ?obj, "Task reconciliation successful"),
                Err(e) => error!(error = ?e, "Task reconciliation error"),
            }
        })
        .await;

    info!("Task controller shutting down");
}

/// Watch Agent, Tool and Route deletions and drop their metric series.
/// The Task controller removes its series from the finalizer cleanup path
/// instead.
async fn run_metrics_reaper(client: Client, metrics: Arc<ControllerMetrics>) {
    let agents = {
        let metrics = metrics.clone();
        watch_deletions(Api::<Agent>::all(client.clone()), move |namespace, name| {
            metrics.delete_agent(name, namespace);
        })
    };
    let tools = {
        let metrics = metrics.clone();
        watch_deletions(Api::<Tool>::all(client.clone()), move |namespace, name| {
            metrics.delete_tool(name, namespace);
        })
    };
    let routes = {
        let metrics = metrics.clone();
        watch_deletions(Api::<Route>::all(client), move |namespace, name| {
            metrics.delete_route(name, namespace);
        })
    };

    futures::join!(agents, tools, routes);
}

async fn watch_deletions<K>(api: Api<K>, on_delete: impl Fn(&str, &str))
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let mut stream = watcher(api, WatcherConfig::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(WatchEvent::Delete(obj)) => {
                let namespace = obj.namespace().unwrap_or_default();
                let name = obj.name_any();
                debug!("Resource deleted, dropping metric series: {namespace}/{name}");
                on_delete(&namespace, &name);
            }
            Ok(_) => {}
            Err(e) => warn!("Deletion watch error: {e}"),
        }
    }
}

fn error_policy_tool(tool: Arc<Tool>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = ?err, tool = %tool.name_any(), "Tool reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}

fn error_policy_agent(agent: Arc<Agent>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = ?err, agent = %agent.name_any(), "Agent reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}

fn error_policy_route(route: Arc<Route>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = ?err, route = %route.name_any(), "Route reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}

fn error_policy_task(task: Arc<Task>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = ?err, task = %task.name_any(), "Task reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}
