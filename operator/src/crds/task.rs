//! `Task` Custom Resource Definition for autonomous execution loops

use super::route::AgentRef;
use super::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Execution phase of a Task.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub enum TaskPhase {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

/// Where the PRD / task list is read from.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskSourceType {
    Inline,
    Configmap,
    Secret,
}

/// Keyed reference into a ConfigMap or Secret.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct TaskSourceKeyRef {
    /// Name of the referenced object
    pub name: String,

    /// Key within the object (defaults to "prd.json")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Source of the PRD content.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct TaskSource {
    /// Source kind
    #[serde(rename = "type")]
    pub source_type: TaskSourceType,

    /// ConfigMap holding the PRD (for type=configmap)
    #[serde(
        default,
        rename = "configMapRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub config_map_ref: Option<TaskSourceKeyRef>,

    /// Secret holding the PRD (for type=secret)
    #[serde(default, rename = "secretRef", skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<TaskSourceKeyRef>,

    /// PRD content embedded in the spec (for type=inline)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
}

/// Execution constraints. Humantime strings for durations.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct TaskLimits {
    /// Maximum loop iterations
    #[serde(
        default,
        rename = "maxIterations",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_iterations: Option<i32>,

    /// Maximum duration of a single iteration
    #[serde(
        default,
        rename = "iterationTimeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub iteration_timeout: Option<String>,

    /// Maximum total duration of the whole task
    #[serde(
        default,
        rename = "totalTimeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_timeout: Option<String>,

    /// Consecutive failures tolerated before giving up
    #[serde(
        default,
        rename = "maxConsecutiveFailures",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_consecutive_failures: Option<i32>,

    /// Times a lost orchestration Job is recreated before the task fails
    #[serde(
        default,
        rename = "maxJobRecreations",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_job_recreations: Option<i32>,
}

/// A command run as a quality check between iterations.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct QualityGate {
    /// Gate identifier
    pub name: String,

    /// Command to execute
    pub command: Vec<String>,

    /// What to do when the gate fails (Fail, Retry, Ignore)
    #[serde(default = "default_failure_policy", rename = "failurePolicy")]
    pub failure_policy: String,

    /// Command timeout (humantime string)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

fn default_failure_policy() -> String {
    "Fail".to_string()
}

fn default_git_provider() -> String {
    "github".to_string()
}

fn default_git_branch() -> String {
    "main".to_string()
}

fn default_git_depth() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

/// Git repository settings for the task workspace.
///
/// Only cloning existing repositories is supported.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct GitConfig {
    /// Repository URL to clone
    pub url: String,

    /// Hosting provider (github, gitlab, bitbucket)
    #[serde(default = "default_git_provider")]
    pub provider: String,

    /// Container image for git operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Branch to work on
    #[serde(default = "default_git_branch")]
    pub branch: String,

    /// Branch to create the working branch from
    #[serde(
        default,
        rename = "baseBranch",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_branch: Option<String>,

    /// Shallow clone depth (0 = full clone)
    #[serde(default = "default_git_depth")]
    pub depth: i32,

    /// Secret holding the access token under key "token"
    #[serde(rename = "credentialsSecret")]
    pub credentials_secret: String,

    /// Author name for commits
    #[serde(
        default,
        rename = "commitAuthor",
        skip_serializing_if = "Option::is_none"
    )]
    pub commit_author: Option<String>,

    /// Author email for commits
    #[serde(
        default,
        rename = "commitEmail",
        skip_serializing_if = "Option::is_none"
    )]
    pub commit_email: Option<String>,

    /// Push automatically on completion
    #[serde(default = "default_true", rename = "autoPush")]
    pub auto_push: bool,

    /// Open a pull request on completion
    #[serde(default = "default_true", rename = "createPR")]
    pub create_pr: bool,

    /// Open the pull request as a draft
    #[serde(default = "default_true", rename = "draftPR")]
    pub draft_pr: bool,

    /// Title for the pull request
    #[serde(default, rename = "prTitle", skip_serializing_if = "Option::is_none")]
    pub pr_title: Option<String>,

    /// Body template for the pull request
    #[serde(default, rename = "prBody", skip_serializing_if = "Option::is_none")]
    pub pr_body: Option<String>,
}

/// `Task` CRD declaring an autonomous multi-step execution loop.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agentmesh.dev", version = "v1alpha1", kind = "Task")]
#[kube(namespaced)]
#[kube(status = "TaskStatus")]
#[kube(shortname = "tk")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Iteration","type":"integer","jsonPath":".status.currentIteration"}"#)]
#[kube(printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.completedTasks"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct TaskSpec {
    /// Agent that executes individual tasks
    #[serde(rename = "workerRef")]
    pub worker_ref: AgentRef,

    /// Orchestrator agent driving the loop (defaults to "task-orchestrator")
    #[serde(
        default,
        rename = "orchestratorRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub orchestrator_ref: Option<AgentRef>,

    /// Where the PRD is read from
    #[serde(rename = "taskSource")]
    pub task_source: TaskSource,

    /// Execution constraints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<TaskLimits>,

    /// Quality checks run after each task
    #[serde(default, rename = "qualityGates")]
    pub quality_gates: Vec<QualityGate>,

    /// Git workspace settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitConfig>,

    /// Suspend the loop without losing progress
    #[serde(default)]
    pub paused: bool,

    /// Extra context passed to the orchestrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Outcome of a single iteration.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct IterationResult {
    /// Iteration number (1-based)
    pub iteration: i32,

    /// Whether the iteration passed its quality gates
    pub passed: bool,

    /// When the iteration started (RFC3339)
    #[serde(rename = "startedAt")]
    pub started_at: String,

    /// When the iteration completed (RFC3339)
    #[serde(
        default,
        rename = "completedAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<String>,

    /// Learnings captured during the iteration
    #[serde(default)]
    pub learnings: String,
}

/// Status of the `Task`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct TaskStatus {
    /// Current execution phase
    #[serde(default)]
    pub phase: Option<TaskPhase>,

    /// Current / last iteration number
    #[serde(default, rename = "currentIteration")]
    pub current_iteration: i32,

    /// Tasks marked as passed so far
    #[serde(default, rename = "completedTasks")]
    pub completed_tasks: i32,

    /// Total tasks found in the PRD
    #[serde(default, rename = "totalTasks")]
    pub total_tasks: i32,

    /// Current streak of consecutive failures
    #[serde(default, rename = "consecutiveFailures")]
    pub consecutive_failures: i32,

    /// When execution started (RFC3339)
    #[serde(default, rename = "startedAt")]
    pub started_at: Option<String>,

    /// When the last iteration ran (RFC3339)
    #[serde(default, rename = "lastIterationAt")]
    pub last_iteration_at: Option<String>,

    /// When the task reached a terminal phase (RFC3339)
    #[serde(default, rename = "completedAt")]
    pub completed_at: Option<String>,

    /// Most recent iteration outcomes (at most 10)
    #[serde(default, rename = "recentIterations")]
    pub recent_iterations: Vec<IterationResult>,

    /// Git repository in use
    #[serde(default, rename = "repositoryUrl")]
    pub repository_url: Option<String>,

    /// SHA of the most recent commit
    #[serde(default, rename = "lastCommitSha")]
    pub last_commit_sha: Option<String>,

    /// Pull request opened on completion
    #[serde(default, rename = "pullRequestUrl")]
    pub pull_request_url: Option<String>,

    /// Last observed generation
    #[serde(default, rename = "observedGeneration")]
    pub observed_generation: Option<i64>,

    /// Human-readable status detail
    #[serde(default)]
    pub message: Option<String>,

    /// Latest observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_source_type_wire_names() {
        let source: TaskSource = serde_json::from_value(serde_json::json!({
            "type": "configmap",
            "configMapRef": {"name": "prd"}
        }))
        .unwrap();
        assert_eq!(source.source_type, TaskSourceType::Configmap);
        assert_eq!(source.config_map_ref.unwrap().name, "prd");
    }

    #[test]
    fn test_git_config_defaults() {
        let git: GitConfig = serde_json::from_value(serde_json::json!({
            "url": "https://github.com/acme/app.git",
            "credentialsSecret": "git-creds"
        }))
        .unwrap();
        assert_eq!(git.provider, "github");
        assert_eq!(git.branch, "main");
        assert_eq!(git.depth, 1);
        assert!(git.auto_push);
        assert!(git.create_pr);
        assert!(git.draft_pr);
    }

    #[test]
    fn test_task_phase_serializes_as_pascal_case() {
        assert_eq!(
            serde_json::to_string(&TaskPhase::Running).unwrap(),
            "\"Running\""
        );
    }
}
