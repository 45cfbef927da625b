//! Task controller: drives the orchestration Job state machine
//! (Pending -> Running -> Completed/Failed/Paused) and extracts the
//! structured result from the Job's logs.

use super::types::{Context, Error, Result, JOB_RECREATIONS_ANNOTATION, TASK_FINALIZER};
use crate::crds::{
    upsert_condition, Agent, AgentRef, Condition, IterationResult, Task, TaskPhase,
    TaskSourceType, TaskStatus,
};
use crate::metrics::{CONTROLLER_TASK, RESULT_ERROR, RESULT_REQUEUE, RESULT_SUCCESS};
use crate::render;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Resource, ResourceExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How often a running Job is polled.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Requeue delay after a resolution or setup failure.
const FAILURE_REQUEUE: Duration = Duration::from_secs(30);

/// Default total timeout when the spec does not set one.
const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Lost Jobs are recreated at most this many times by default.
const DEFAULT_MAX_JOB_RECREATIONS: i32 = 3;

/// Orchestrator agent used when the spec names none.
const DEFAULT_ORCHESTRATOR_NAME: &str = "task-orchestrator";

/// Marker prefix of the structured result line in orchestrator logs.
const RESULT_MARKER: &str = "ORCHESTRATOR_RESULT:";

/// Structured result emitted by the orchestrator on its last line.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorResult {
    pub passed: bool,
    pub completed_tasks: i32,
    pub total_tasks: i32,
    pub iterations: i32,
    pub learnings: String,
    pub commit_sha: String,
    pub pull_request_url: String,
    pub prd: Option<serde_json::Value>,
    pub error: String,
    pub no_changes: bool,
    pub pushed: bool,
    pub git_error: String,
}

#[instrument(skip(ctx), fields(task = %task.name_any()))]
pub async fn reconcile_task(task: Arc<Task>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let namespace = task.namespace().ok_or(Error::MissingObjectKey)?;
    let tasks: Api<Task> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&tasks, TASK_FINALIZER, task.clone(), |event| async {
        match event {
            FinalizerEvent::Apply(task) => reconcile_task_apply(task, &ctx).await,
            FinalizerEvent::Cleanup(task) => cleanup_task(task, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::Kube(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::Config("invalid finalizer name".to_string())
        }
    });

    match &result {
        Ok(_) => ctx.metrics.record_reconcile(
            CONTROLLER_TASK,
            RESULT_SUCCESS,
            start.elapsed().as_secs_f64(),
        ),
        Err(e) if e.is_conflict() => ctx.metrics.record_reconcile(
            CONTROLLER_TASK,
            RESULT_REQUEUE,
            start.elapsed().as_secs_f64(),
        ),
        Err(_) => {
            ctx.metrics
                .record_reconcile(CONTROLLER_TASK, RESULT_ERROR, start.elapsed().as_secs_f64());
        }
    }

    // A racing status writer is a signal to retry, not an error
    match result {
        Err(e) if e.is_conflict() => Ok(Action::requeue(Duration::from_secs(1))),
        other => other,
    }
}

async fn reconcile_task_apply(task: Arc<Task>, ctx: &Context) -> Result<Action> {
    let name = task.name_any();
    let namespace = task.namespace().ok_or(Error::MissingObjectKey)?;
    let phase = task.status.as_ref().and_then(|s| s.phase.clone());
    debug!("Reconciling Task {namespace}/{name} (phase={phase:?})");

    // First observation: initialize counters and enter Pending
    let Some(phase) = phase else {
        let mut status = task.status.clone().unwrap_or_default();
        status.phase = Some(TaskPhase::Pending);
        status.current_iteration = 0;
        status.completed_tasks = 0;
        status.consecutive_failures = 0;
        update_status(&task, ctx, &status).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    };

    // Terminal phases stay terminal
    if matches!(phase, TaskPhase::Completed | TaskPhase::Failed) {
        record_phase_metric(&task, ctx, &phase);
        return Ok(Action::await_change());
    }

    // Pause wins over everything non-terminal
    if task.spec.paused {
        if phase != TaskPhase::Paused {
            let mut status = task.status.clone().unwrap_or_default();
            status.phase = Some(TaskPhase::Paused);
            upsert_condition(
                &mut status.conditions,
                Condition::ready(false, "Paused", "Task is paused", task.metadata.generation),
            );
            update_status(&task, ctx, &status).await?;
            info!("Task {namespace}/{name} paused");
        }
        record_phase_metric(&task, ctx, &TaskPhase::Paused);
        return Ok(Action::await_change());
    }

    if phase == TaskPhase::Paused {
        // Resume: clear the failure streak
        let mut status = task.status.clone().unwrap_or_default();
        status.phase = Some(TaskPhase::Running);
        status.consecutive_failures = 0;
        upsert_condition(
            &mut status.conditions,
            Condition::ready(
                false,
                "Resumed",
                "Task resumed from paused state",
                task.metadata.generation,
            ),
        );
        update_status(&task, ctx, &status).await?;
        info!("Task {namespace}/{name} resumed");
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let action = match phase {
        TaskPhase::Pending => handle_pending(&task, ctx, &namespace).await?,
        TaskPhase::Running => handle_running(&task, ctx, &namespace).await?,
        _ => Action::await_change(),
    };

    record_phase_metric(&task, ctx, &phase);
    Ok(action)
}

fn record_phase_metric(task: &Task, ctx: &Context, phase: &TaskPhase) {
    let phase_name = serde_json::to_value(phase)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let status = task.status.as_ref();
    ctx.metrics.set_task_metrics(
        &task.name_any(),
        &task.namespace().unwrap_or_default(),
        &phase_name,
        status.map_or(0, |s| s.current_iteration),
        status.map_or(0, |s| s.completed_tasks),
        status.map_or(0, |s| s.total_tasks),
    );
}

/// Pending: resolve agents, materialize the workspace, load the PRD and
/// launch the orchestration Job.
async fn handle_pending(task: &Arc<Task>, ctx: &Context, namespace: &str) -> Result<Action> {
    let name = task.name_any();

    let orchestrator = match get_orchestrator_agent(task, ctx, namespace).await {
        Ok(agent) => agent,
        Err(Error::AgentResolution(message)) => {
            return fail_pending(task, ctx, "OrchestratorNotFound", &message).await;
        }
        Err(e) => return Err(e),
    };

    let worker = match get_agent(&task.spec.worker_ref, ctx, namespace).await {
        Ok(agent) => agent,
        Err(Error::AgentResolution(message)) => {
            return fail_pending(task, ctx, "WorkerNotFound", &message).await;
        }
        Err(e) => return Err(e),
    };

    ensure_workspace_pvc(task, ctx, namespace).await?;

    let prd = match load_task_source(task, ctx, namespace).await {
        Ok(content) => content,
        Err(Error::TaskSource(message)) => {
            return fail_pending(task, ctx, "TaskSourceError", &message).await;
        }
        Err(e) => return Err(e),
    };

    let total_tasks = count_tasks_in_prd(&prd);
    let worker_endpoint = worker_http_endpoint(&worker);

    let job = match render::orchestrator_job(render::OrchestratorJobParams {
        task: task.as_ref(),
        orchestrator_agent: &orchestrator,
        worker_endpoint,
        workspace_pvc: render::workspace_pvc_name(task),
        prd: &prd,
    }) {
        Ok(job) => job,
        Err(e) => {
            return fail_pending(task, ctx, "JobRenderError", &e.to_string()).await;
        }
    };

    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let mut job = job;
    if let Some(owner_ref) = task.controller_owner_ref(&()) {
        job.metadata.owner_references = Some(vec![owner_ref]);
    }
    match jobs.create(&kube::api::PostParams::default(), &job).await {
        Ok(_) => info!("Created orchestration Job for Task {namespace}/{name}"),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!("Orchestration Job for Task {namespace}/{name} already exists");
        }
        Err(e) => return Err(e.into()),
    }

    let mut status = task.status.clone().unwrap_or_default();
    status.phase = Some(TaskPhase::Running);
    status.started_at = Some(Utc::now().to_rfc3339());
    status.total_tasks = total_tasks;
    if let Some(git) = &task.spec.git {
        status.repository_url = Some(git.url.clone());
    }
    upsert_condition(
        &mut status.conditions,
        Condition::ready(
            false,
            "Running",
            "Orchestrator Job started",
            task.metadata.generation,
        ),
    );
    update_status(task, ctx, &status).await?;

    Ok(Action::requeue(JOB_POLL_INTERVAL))
}

async fn fail_pending(task: &Task, ctx: &Context, reason: &str, message: &str) -> Result<Action> {
    warn!("Task {} pending setup failed: {message}", task.name_any());
    let mut status = task.status.clone().unwrap_or_default();
    upsert_condition(
        &mut status.conditions,
        Condition::ready(false, reason, message, task.metadata.generation),
    );
    update_status(task, ctx, &status).await?;
    Ok(Action::requeue(FAILURE_REQUEUE))
}

/// Running: poll the Job, handle loss, deadline, success and failure.
async fn handle_running(task: &Arc<Task>, ctx: &Context, namespace: &str) -> Result<Action> {
    let name = task.name_any();

    // Total timeout is enforced here as well as via the Job deadline
    let total_timeout = render::parse_duration_or(
        task.spec
            .limits
            .as_ref()
            .and_then(|l| l.total_timeout.as_deref()),
        DEFAULT_TOTAL_TIMEOUT,
    );
    if let Some(started_at) = task
        .status
        .as_ref()
        .and_then(|s| s.started_at.as_deref())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
    {
        let elapsed = Utc::now().signed_duration_since(started_at.with_timezone(&Utc));
        if elapsed.to_std().unwrap_or_default() > total_timeout {
            let message = format!("Total timeout exceeded: {}", humantime::format_duration(total_timeout));
            warn!("Task {namespace}/{name}: {message}");
            fail_task(task, ctx, "TotalTimeoutExceeded", &message).await?;
            cleanup_orchestrator_job(task, ctx, namespace).await;
            return Ok(Action::await_change());
        }
    }

    let job_name = render::orchestrator_job_name(task);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);

    let job = match jobs.get(&job_name).await {
        Ok(job) => job,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return handle_job_lost(task, ctx, namespace, &job_name).await;
        }
        Err(e) => return Err(e.into()),
    };

    let job_status = job.status.clone().unwrap_or_default();

    if job_status.succeeded.unwrap_or(0) > 0 {
        info!("Orchestration Job {job_name} succeeded");
        return handle_job_success(task, ctx, namespace, &job).await;
    }

    if job_status.failed.unwrap_or(0) > 0 {
        info!("Orchestration Job {job_name} failed");
        return handle_job_failure(task, ctx, namespace, &job).await;
    }

    let deadline_exceeded = job_status.conditions.unwrap_or_default().iter().any(|c| {
        c.type_ == "Failed" && c.status == "True" && c.reason.as_deref() == Some("DeadlineExceeded")
    });
    if deadline_exceeded {
        warn!("Orchestration Job {job_name} exceeded its deadline");
        fail_task(task, ctx, "JobDeadlineExceeded", "Orchestrator Job deadline exceeded").await?;
        return Ok(Action::await_change());
    }

    debug!("Orchestration Job {job_name} still running");
    Ok(Action::requeue(JOB_POLL_INTERVAL))
}

/// The Job vanished: recreate it within the recreation budget, fail after.
async fn handle_job_lost(
    task: &Arc<Task>,
    ctx: &Context,
    namespace: &str,
    job_name: &str,
) -> Result<Action> {
    let name = task.name_any();
    let recreations = task
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(JOB_RECREATIONS_ANNOTATION))
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0)
        + 1;

    let max_recreations = task
        .spec
        .limits
        .as_ref()
        .and_then(|l| l.max_job_recreations)
        .unwrap_or(DEFAULT_MAX_JOB_RECREATIONS);

    if recreations > max_recreations {
        let message = format!("Orchestrator Job lost {} times, giving up", recreations - 1);
        warn!("Task {namespace}/{name}: {message}");
        fail_task(task, ctx, "JobLost", &message).await?;
        return Ok(Action::await_change());
    }

    warn!(
        "Orchestration Job {job_name} not found, recreating ({recreations}/{max_recreations})"
    );

    let tasks: Api<Task> = Api::namespaced(ctx.client.clone(), namespace);
    tasks
        .patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({
                "metadata": {
                    "annotations": {JOB_RECREATIONS_ANNOTATION: recreations.to_string()}
                }
            })),
        )
        .await?;

    let mut status = task.status.clone().unwrap_or_default();
    status.phase = Some(TaskPhase::Pending);
    update_status(task, ctx, &status).await?;

    Ok(Action::requeue(FAILURE_REQUEUE))
}

async fn handle_job_success(
    task: &Arc<Task>,
    ctx: &Context,
    namespace: &str,
    job: &Job,
) -> Result<Action> {
    let name = task.name_any();

    let result = match read_orchestrator_result(ctx, namespace, job).await {
        Ok(result) => result,
        Err(e) => {
            // The Job succeeded; a missing marker only loses detail
            warn!("Task {namespace}/{name}: result extraction failed: {e}");
            OrchestratorResult {
                passed: true,
                learnings: "Job completed but result extraction failed".to_string(),
                ..Default::default()
            }
        }
    };

    let now = Utc::now().to_rfc3339();
    let mut status = task.status.clone().unwrap_or_default();
    status.completed_at = Some(now.clone());
    status.current_iteration = result.iterations;
    status.completed_tasks = result.completed_tasks;
    if result.total_tasks > 0 {
        status.total_tasks = result.total_tasks;
    }
    if !result.commit_sha.is_empty() {
        status.last_commit_sha = Some(result.commit_sha.clone());
    }
    if !result.pull_request_url.is_empty() {
        status.pull_request_url = Some(result.pull_request_url.clone());
    }

    if result.passed {
        status.phase = Some(TaskPhase::Completed);
        status.message = Some("All tasks completed successfully".to_string());
        upsert_condition(
            &mut status.conditions,
            Condition::ready(
                true,
                "Completed",
                "All tasks completed successfully",
                task.metadata.generation,
            ),
        );
    } else {
        status.phase = Some(TaskPhase::Failed);
        let message = if result.error.is_empty() {
            "Orchestrator completed but not all tasks passed".to_string()
        } else {
            result.error.clone()
        };
        status.message = Some(message.clone());
        upsert_condition(
            &mut status.conditions,
            Condition::ready(false, "PartialCompletion", &message, task.metadata.generation),
        );
    }

    push_iteration(&mut status, &result, &now);
    status.observed_generation = task.metadata.generation;

    // Persist the updated PRD back to its source ConfigMap
    if let Some(prd) = &result.prd {
        if let Err(e) = persist_updated_prd(task, ctx, namespace, prd).await {
            warn!("Task {namespace}/{name}: failed to persist updated PRD: {e}");
        }
    }

    update_status(task, ctx, &status).await?;

    info!(
        "Task {namespace}/{name} finished (passed={}, {}/{} tasks)",
        result.passed, result.completed_tasks, result.total_tasks
    );
    Ok(Action::await_change())
}

async fn handle_job_failure(
    task: &Arc<Task>,
    ctx: &Context,
    namespace: &str,
    job: &Job,
) -> Result<Action> {
    let name = task.name_any();

    // Best effort: a failing orchestrator may still have written a result
    let result = read_orchestrator_result(ctx, namespace, job).await.ok();

    let now = Utc::now().to_rfc3339();
    let mut status = task.status.clone().unwrap_or_default();
    status.phase = Some(TaskPhase::Failed);
    status.completed_at = Some(now);

    let mut message = "Orchestrator Job failed".to_string();
    if let Some(result) = &result {
        status.current_iteration = result.iterations;
        status.completed_tasks = result.completed_tasks;
        if !result.error.is_empty() {
            message = result.error.clone();
        }
        if !result.commit_sha.is_empty() {
            status.last_commit_sha = Some(result.commit_sha.clone());
        }
    }
    status.message = Some(message.clone());
    upsert_condition(
        &mut status.conditions,
        Condition::ready(false, "JobFailed", &message, task.metadata.generation),
    );
    status.observed_generation = task.metadata.generation;

    update_status(task, ctx, &status).await?;

    info!("Task {namespace}/{name} failed: {message}");
    Ok(Action::await_change())
}

async fn fail_task(task: &Task, ctx: &Context, reason: &str, message: &str) -> Result<()> {
    let mut status = task.status.clone().unwrap_or_default();
    status.phase = Some(TaskPhase::Failed);
    status.message = Some(message.to_string());
    status.completed_at = Some(Utc::now().to_rfc3339());
    upsert_condition(
        &mut status.conditions,
        Condition::ready(false, reason, message, task.metadata.generation),
    );
    update_status(task, ctx, &status).await
}

fn push_iteration(status: &mut TaskStatus, result: &OrchestratorResult, now: &str) {
    let started_at = status.started_at.clone().unwrap_or_else(|| now.to_string());
    status.recent_iterations.push(IterationResult {
        iteration: result.iterations,
        passed: result.passed,
        started_at,
        completed_at: Some(now.to_string()),
        learnings: result.learnings.clone(),
    });
    let len = status.recent_iterations.len();
    if len > 10 {
        status.recent_iterations.drain(..len - 10);
    }
}

/// Stream the final pod's log tail and parse the last result marker line.
async fn read_orchestrator_result(
    ctx: &Context,
    namespace: &str,
    job: &Job,
) -> Result<OrchestratorResult> {
    let job_name = job.name_any();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let pod_list = pods
        .list(&ListParams::default().labels(&format!("job-name={job_name}")))
        .await?;
    let pod = pod_list
        .items
        .first()
        .ok_or_else(|| Error::Config(format!("no pods found for Job {job_name}")))?;

    let logs = pods
        .logs(
            &pod.name_any(),
            &LogParams {
                container: Some("orchestrator".to_string()),
                tail_lines: Some(1000),
                ..Default::default()
            },
        )
        .await?;

    parse_orchestrator_result(&logs)
}

/// Scan log lines for the result marker; the last match wins so extra log
/// output after the marker is tolerated.
pub fn parse_orchestrator_result(logs: &str) -> Result<OrchestratorResult> {
    let mut payload = None;
    for line in logs.lines() {
        if let Some(idx) = line.find(RESULT_MARKER) {
            payload = Some(&line[idx + RESULT_MARKER.len()..]);
        }
    }

    let payload =
        payload.ok_or_else(|| Error::Config("orchestrator result marker not found in logs".to_string()))?;

    serde_json::from_str(payload.trim())
        .map_err(|e| Error::Config(format!("failed to parse orchestrator result: {e}")))
}

async fn cleanup_orchestrator_job(task: &Task, ctx: &Context, namespace: &str) {
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let job_name = render::orchestrator_job_name(task);
    match jobs.delete(&job_name, &DeleteParams::background()).await {
        Ok(_) => debug!("Deleted orchestration Job {job_name}"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => warn!("Failed to delete orchestration Job {job_name}: {e}"),
    }
}

/// Finalizer cleanup: remove the Job and the workspace claim, leave the
/// terminal phase untouched.
async fn cleanup_task(task: Arc<Task>, ctx: &Context) -> Result<Action> {
    let name = task.name_any();
    let namespace = task.namespace().ok_or(Error::MissingObjectKey)?;
    info!("Cleaning up resources for Task {namespace}/{name}");

    cleanup_orchestrator_job(&task, ctx, &namespace).await;

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    let pvc_name = render::workspace_pvc_name(&task);
    match pvcs.delete(&pvc_name, &DeleteParams::default()).await {
        Ok(_) => debug!("Deleted workspace claim {pvc_name}"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => warn!("Failed to delete workspace claim {pvc_name}: {e}"),
    }

    ctx.metrics.delete_task(&name, &namespace);
    Ok(Action::await_change())
}

async fn get_orchestrator_agent(task: &Task, ctx: &Context, namespace: &str) -> Result<Agent> {
    let default_ref = AgentRef {
        name: DEFAULT_ORCHESTRATOR_NAME.to_string(),
        namespace: Some(namespace.to_string()),
    };
    let agent_ref = task.spec.orchestrator_ref.as_ref().unwrap_or(&default_ref);
    get_agent(agent_ref, ctx, namespace).await
}

async fn get_agent(agent_ref: &AgentRef, ctx: &Context, default_namespace: &str) -> Result<Agent> {
    let namespace = agent_ref.namespace.as_deref().unwrap_or(default_namespace);
    let api: Api<Agent> = Api::namespaced(ctx.client.clone(), namespace);
    match api.get(&agent_ref.name).await {
        Ok(agent) => Ok(agent),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::AgentResolution(format!(
            "Agent {namespace}/{} not found",
            agent_ref.name
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Worker HTTP endpoint handed to the orchestrator.
fn worker_http_endpoint(agent: &Agent) -> String {
    format!(
        "http://{}.{}:8080",
        agent.name_any(),
        agent.namespace().unwrap_or_default()
    )
}

async fn ensure_workspace_pvc(task: &Arc<Task>, ctx: &Context, namespace: &str) -> Result<()> {
    let mut pvc = render::task_workspace_pvc(task)?;
    if let Some(owner_ref) = task.controller_owner_ref(&()) {
        pvc.metadata.owner_references = Some(vec![owner_ref]);
    }

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
    match pvcs.create(&kube::api::PostParams::default(), &pvc).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Load the PRD from its declared source.
async fn load_task_source(task: &Task, ctx: &Context, namespace: &str) -> Result<String> {
    let source = &task.spec.task_source;

    match source.source_type {
        TaskSourceType::Inline => source
            .inline
            .clone()
            .ok_or_else(|| Error::TaskSource("inline content is required for inline source".to_string())),

        TaskSourceType::Configmap => {
            let key_ref = source
                .config_map_ref
                .as_ref()
                .ok_or_else(|| Error::TaskSource("configMapRef is required for configmap source".to_string()))?;
            let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
            let cm = api.get(&key_ref.name).await.map_err(|e| {
                Error::TaskSource(format!("failed to get ConfigMap {}: {e}", key_ref.name))
            })?;
            let key = key_ref.key.as_deref().unwrap_or("prd.json");
            cm.data
                .as_ref()
                .and_then(|data| data.get(key))
                .cloned()
                .ok_or_else(|| {
                    Error::TaskSource(format!("key {key} not found in ConfigMap {}", key_ref.name))
                })
        }

        TaskSourceType::Secret => {
            let key_ref = source
                .secret_ref
                .as_ref()
                .ok_or_else(|| Error::TaskSource("secretRef is required for secret source".to_string()))?;
            let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
            let secret = api.get(&key_ref.name).await.map_err(|e| {
                Error::TaskSource(format!("failed to get Secret {}: {e}", key_ref.name))
            })?;
            let key = key_ref.key.as_deref().unwrap_or("prd.json");
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
                .ok_or_else(|| {
                    Error::TaskSource(format!("key {key} not found in Secret {}", key_ref.name))
                })
        }
    }
}

/// Count tasks by JSON-parsing the PRD for a tasks[] or stories[] array.
pub fn count_tasks_in_prd(prd: &str) -> i32 {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(prd) else {
        return 0;
    };

    let count = value
        .get("tasks")
        .and_then(|t| t.as_array())
        .map(Vec::len)
        .filter(|len| *len > 0)
        .or_else(|| value.get("stories").and_then(|s| s.as_array()).map(Vec::len))
        .unwrap_or(0);

    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Write the updated PRD back to the source ConfigMap. Only configmap
/// sources are persisted.
async fn persist_updated_prd(
    task: &Task,
    ctx: &Context,
    namespace: &str,
    prd: &serde_json::Value,
) -> Result<()> {
    let source = &task.spec.task_source;
    if source.source_type != TaskSourceType::Configmap {
        return Ok(());
    }
    let key_ref = source
        .config_map_ref
        .as_ref()
        .ok_or_else(|| Error::TaskSource("configMapRef is required for configmap source".to_string()))?;
    let key = key_ref.key.as_deref().unwrap_or("prd.json");

    let content = serde_json::to_string_pretty(prd)?;
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch(
        &key_ref.name,
        &PatchParams::default(),
        &Patch::Merge(&json!({"data": {key: content}})),
    )
    .await?;
    Ok(())
}

async fn update_status(task: &Task, ctx: &Context, status: &TaskStatus) -> Result<()> {
    let namespace = task.namespace().unwrap_or_default();
    let api: Api<Task> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &task.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({"status": status})),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tasks_in_prd() {
        assert_eq!(count_tasks_in_prd(r#"{"tasks":[{"id":"1"},{"id":"2"}]}"#), 2);
        assert_eq!(count_tasks_in_prd(r#"{"stories":[{"id":"a"}]}"#), 1);
        assert_eq!(count_tasks_in_prd(r#"{"tasks":[],"stories":[{"id":"a"}]}"#), 1);
        assert_eq!(count_tasks_in_prd("not json"), 0);
        assert_eq!(count_tasks_in_prd("{}"), 0);
    }

    #[test]
    fn test_parse_orchestrator_result_last_marker_wins() {
        let logs = concat!(
            "iteration 1 starting\n",
            "ORCHESTRATOR_RESULT:{\"passed\":false,\"iterations\":1}\n",
            "iteration 2 starting\n",
            "ORCHESTRATOR_RESULT:{\"passed\":true,\"iterations\":2,\"completedTasks\":3,\"totalTasks\":3}\n",
            "shutting down\n",
        );

        let result = parse_orchestrator_result(logs).unwrap();
        assert!(result.passed);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.completed_tasks, 3);
        assert_eq!(result.total_tasks, 3);
    }

    #[test]
    fn test_parse_orchestrator_result_tolerates_prefixed_lines() {
        let logs = "2025-06-01T10:00:00Z INFO ORCHESTRATOR_RESULT:{\"passed\":true}\n";
        assert!(parse_orchestrator_result(logs).unwrap().passed);
    }

    #[test]
    fn test_parse_orchestrator_result_missing_marker() {
        let err = parse_orchestrator_result("nothing to see here\n").unwrap_err();
        assert!(err.to_string().contains("marker not found"));
    }

    #[test]
    fn test_parse_orchestrator_result_full_payload() {
        let logs = concat!(
            "ORCHESTRATOR_RESULT:{\"passed\":true,\"completedTasks\":4,\"totalTasks\":4,",
            "\"iterations\":6,\"learnings\":\"cache the schema\",\"commitSha\":\"abc123\",",
            "\"pullRequestUrl\":\"https://github.com/acme/app/pull/7\",\"pushed\":true,",
            "\"prd\":{\"tasks\":[]}}\n"
        );
        let result = parse_orchestrator_result(logs).unwrap();
        assert_eq!(result.commit_sha, "abc123");
        assert_eq!(result.pull_request_url, "https://github.com/acme/app/pull/7");
        assert!(result.pushed);
        assert!(result.prd.is_some());
    }

    #[test]
    fn test_push_iteration_keeps_at_most_ten() {
        let mut status = TaskStatus::default();
        for i in 0..12 {
            let result = OrchestratorResult {
                iterations: i,
                passed: true,
                ..Default::default()
            };
            push_iteration(&mut status, &result, "2025-06-01T10:00:00+00:00");
        }
        assert_eq!(status.recent_iterations.len(), 10);
        assert_eq!(status.recent_iterations[0].iteration, 2);
        assert_eq!(status.recent_iterations[9].iteration, 11);
    }
}
