//! Prometheus metrics for the reconciliation engine.
//!
//! Collectors are plain maps behind locks with a text-format exporter; the
//! exporter output is served on the metrics listener. Every per-resource
//! series is deleted when its resource goes away.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Controller names used as metric labels.
pub const CONTROLLER_AGENT: &str = "agent";
pub const CONTROLLER_TOOL: &str = "tool";
pub const CONTROLLER_ROUTE: &str = "route";
pub const CONTROLLER_TASK: &str = "task";

/// Reconcile outcome labels.
pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";
pub const RESULT_REQUEUE: &str = "requeue";

#[derive(Default)]
struct DurationStat {
    sum: f64,
    count: u64,
}

/// Per-agent gauge set.
struct AgentSeries {
    model: String,
    image: String,
    ready: bool,
    desired_replicas: i32,
    available_replicas: i32,
    tools: usize,
}

/// Per-tool gauge set.
struct ToolSeries {
    ready: bool,
    definitions: usize,
}

/// Per-route gauge set.
struct RouteSeries {
    rules: i32,
    ready_backends: usize,
}

/// Per-task gauge set.
struct TaskSeries {
    phase: String,
    iteration: i32,
    completed_tasks: i32,
    total_tasks: i32,
}

type SeriesKey = (String, String); // (namespace, name)

/// Central collector for the operator process.
#[derive(Default)]
pub struct ControllerMetrics {
    reconciles_total: Mutex<BTreeMap<(String, String), u64>>,
    reconcile_errors_total: Mutex<BTreeMap<(String, String), u64>>,
    reconcile_duration: Mutex<BTreeMap<String, DurationStat>>,
    agents: Mutex<BTreeMap<SeriesKey, AgentSeries>>,
    tools: Mutex<BTreeMap<SeriesKey, ToolSeries>>,
    routes: Mutex<BTreeMap<SeriesKey, RouteSeries>>,
    tasks: Mutex<BTreeMap<SeriesKey, TaskSeries>>,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reconcile(&self, controller: &str, result: &str, seconds: f64) {
        *self
            .reconciles_total
            .lock()
            .entry((controller.to_string(), result.to_string()))
            .or_insert(0) += 1;

        let mut durations = self.reconcile_duration.lock();
        let stat = durations.entry(controller.to_string()).or_default();
        stat.sum += seconds;
        stat.count += 1;
    }

    pub fn record_reconcile_error(&self, controller: &str, reason: &str) {
        *self
            .reconcile_errors_total
            .lock()
            .entry((controller.to_string(), reason.to_string()))
            .or_insert(0) += 1;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_agent_metrics(
        &self,
        name: &str,
        namespace: &str,
        model: &str,
        image: &str,
        ready: bool,
        desired_replicas: i32,
        available_replicas: i32,
        tools: usize,
    ) {
        self.agents.lock().insert(
            (namespace.to_string(), name.to_string()),
            AgentSeries {
                model: model.to_string(),
                image: image.to_string(),
                ready,
                desired_replicas,
                available_replicas,
                tools,
            },
        );
    }

    pub fn delete_agent(&self, name: &str, namespace: &str) {
        self.agents
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn set_tool_metrics(&self, name: &str, namespace: &str, ready: bool, definitions: usize) {
        self.tools.lock().insert(
            (namespace.to_string(), name.to_string()),
            ToolSeries { ready, definitions },
        );
    }

    pub fn delete_tool(&self, name: &str, namespace: &str) {
        self.tools
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn set_route_metrics(&self, name: &str, namespace: &str, rules: i32, ready_backends: usize) {
        self.routes.lock().insert(
            (namespace.to_string(), name.to_string()),
            RouteSeries {
                rules,
                ready_backends,
            },
        );
    }

    pub fn delete_route(&self, name: &str, namespace: &str) {
        self.routes
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn set_task_metrics(
        &self,
        name: &str,
        namespace: &str,
        phase: &str,
        iteration: i32,
        completed_tasks: i32,
        total_tasks: i32,
    ) {
        self.tasks.lock().insert(
            (namespace.to_string(), name.to_string()),
            TaskSeries {
                phase: phase.to_string(),
                iteration,
                completed_tasks,
                total_tasks,
            },
        );
    }

    pub fn delete_task(&self, name: &str, namespace: &str) {
        self.tasks
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Render every collector in Prometheus text exposition format.
    #[allow(clippy::too_many_lines)]
    pub fn export(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE operator_reconciles_total counter\n");
        for ((controller, result), value) in self.reconciles_total.lock().iter() {
            let _ = writeln!(
                out,
                "operator_reconciles_total{{controller=\"{controller}\",result=\"{result}\"}} {value}"
            );
        }

        out.push_str("# TYPE operator_reconcile_errors_total counter\n");
        for ((controller, reason), value) in self.reconcile_errors_total.lock().iter() {
            let _ = writeln!(
                out,
                "operator_reconcile_errors_total{{controller=\"{controller}\",reason=\"{reason}\"}} {value}"
            );
        }

        out.push_str("# TYPE operator_reconcile_duration_seconds summary\n");
        for (controller, stat) in self.reconcile_duration.lock().iter() {
            let _ = writeln!(
                out,
                "operator_reconcile_duration_seconds_sum{{controller=\"{controller}\"}} {}",
                stat.sum
            );
            let _ = writeln!(
                out,
                "operator_reconcile_duration_seconds_count{{controller=\"{controller}\"}} {}",
                stat.count
            );
        }

        out.push_str("# TYPE operator_agent_info gauge\n");
        for ((namespace, name), series) in self.agents.lock().iter() {
            let _ = writeln!(
                out,
                "operator_agent_info{{namespace=\"{namespace}\",agent=\"{name}\",model=\"{}\",image=\"{}\"}} 1",
                series.model, series.image
            );
        }

        out.push_str("# TYPE operator_agent_ready gauge\n");
        for ((namespace, name), series) in self.agents.lock().iter() {
            let _ = writeln!(
                out,
                "operator_agent_ready{{namespace=\"{namespace}\",agent=\"{name}\"}} {}",
                i32::from(series.ready)
            );
        }

        out.push_str("# TYPE operator_agent_replicas gauge\n");
        for ((namespace, name), series) in self.agents.lock().iter() {
            let _ = writeln!(
                out,
                "operator_agent_replicas{{namespace=\"{namespace}\",agent=\"{name}\"}} {}",
                series.desired_replicas
            );
        }

        out.push_str("# TYPE operator_agent_replicas_available gauge\n");
        for ((namespace, name), series) in self.agents.lock().iter() {
            let _ = writeln!(
                out,
                "operator_agent_replicas_available{{namespace=\"{namespace}\",agent=\"{name}\"}} {}",
                series.available_replicas
            );
        }

        out.push_str("# TYPE operator_agent_tools gauge\n");
        for ((namespace, name), series) in self.agents.lock().iter() {
            let _ = writeln!(
                out,
                "operator_agent_tools{{namespace=\"{namespace}\",agent=\"{name}\"}} {}",
                series.tools
            );
        }

        out.push_str("# TYPE operator_tool_ready gauge\n");
        for ((namespace, name), series) in self.tools.lock().iter() {
            let _ = writeln!(
                out,
                "operator_tool_ready{{namespace=\"{namespace}\",tool=\"{name}\"}} {}",
                i32::from(series.ready)
            );
        }

        out.push_str("# TYPE operator_tool_definitions gauge\n");
        for ((namespace, name), series) in self.tools.lock().iter() {
            let _ = writeln!(
                out,
                "operator_tool_definitions{{namespace=\"{namespace}\",tool=\"{name}\"}} {}",
                series.definitions
            );
        }

        out.push_str("# TYPE operator_route_rules gauge\n");
        for ((namespace, name), series) in self.routes.lock().iter() {
            let _ = writeln!(
                out,
                "operator_route_rules{{namespace=\"{namespace}\",route=\"{name}\"}} {}",
                series.rules
            );
        }

        out.push_str("# TYPE operator_route_backends_ready gauge\n");
        for ((namespace, name), series) in self.routes.lock().iter() {
            let _ = writeln!(
                out,
                "operator_route_backends_ready{{namespace=\"{namespace}\",route=\"{name}\"}} {}",
                series.ready_backends
            );
        }

        out.push_str("# TYPE operator_task_phase gauge\n");
        for ((namespace, name), series) in self.tasks.lock().iter() {
            let _ = writeln!(
                out,
                "operator_task_phase{{namespace=\"{namespace}\",task=\"{name}\",phase=\"{}\"}} 1",
                series.phase
            );
        }

        out.push_str("# TYPE operator_task_iteration gauge\n");
        for ((namespace, name), series) in self.tasks.lock().iter() {
            let _ = writeln!(
                out,
                "operator_task_iteration{{namespace=\"{namespace}\",task=\"{name}\"}} {}",
                series.iteration
            );
        }

        out.push_str("# TYPE operator_task_completed_tasks gauge\n");
        for ((namespace, name), series) in self.tasks.lock().iter() {
            let _ = writeln!(
                out,
                "operator_task_completed_tasks{{namespace=\"{namespace}\",task=\"{name}\"}} {}",
                series.completed_tasks
            );
        }

        out.push_str("# TYPE operator_task_total_tasks gauge\n");
        for ((namespace, name), series) in self.tasks.lock().iter() {
            let _ = writeln!(
                out,
                "operator_task_total_tasks{{namespace=\"{namespace}\",task=\"{name}\"}} {}",
                series.total_tasks
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_includes_reconcile_counters() {
        let metrics = ControllerMetrics::new();
        metrics.record_reconcile(CONTROLLER_AGENT, RESULT_SUCCESS, 0.01);
        metrics.record_reconcile(CONTROLLER_AGENT, RESULT_SUCCESS, 0.02);
        metrics.record_reconcile_error(CONTROLLER_ROUTE, "status_update");

        let text = metrics.export();
        assert!(text.contains(
            "operator_reconciles_total{controller=\"agent\",result=\"success\"} 2"
        ));
        assert!(text.contains(
            "operator_reconcile_errors_total{controller=\"route\",reason=\"status_update\"} 1"
        ));
        assert!(text.contains("operator_reconcile_duration_seconds_count{controller=\"agent\"} 2"));
    }

    #[test]
    fn test_agent_series_carries_info_and_replicas() {
        let metrics = ControllerMetrics::new();
        metrics.set_agent_metrics(
            "alpha",
            "agents",
            "claude-sonnet-4-20250514",
            "ghcr.io/agentmesh/agent-runner:latest",
            true,
            2,
            1,
            3,
        );

        let text = metrics.export();
        assert!(text.contains(
            "operator_agent_info{namespace=\"agents\",agent=\"alpha\",model=\"claude-sonnet-4-20250514\",image=\"ghcr.io/agentmesh/agent-runner:latest\"} 1"
        ));
        assert!(text.contains("operator_agent_ready{namespace=\"agents\",agent=\"alpha\"} 1"));
        assert!(text.contains("operator_agent_replicas{namespace=\"agents\",agent=\"alpha\"} 2"));
        assert!(text.contains(
            "operator_agent_replicas_available{namespace=\"agents\",agent=\"alpha\"} 1"
        ));
        assert!(text.contains("operator_agent_tools{namespace=\"agents\",agent=\"alpha\"} 3"));
    }

    #[test]
    fn test_tool_route_and_task_series() {
        let metrics = ControllerMetrics::new();
        metrics.set_tool_metrics("string-tools", "agents", true, 4);
        metrics.set_route_metrics("main", "agents", 5, 2);
        metrics.set_task_metrics("build-api", "agents", "Running", 3, 1, 6);

        let text = metrics.export();
        assert!(text.contains("operator_tool_ready{namespace=\"agents\",tool=\"string-tools\"} 1"));
        assert!(text.contains(
            "operator_tool_definitions{namespace=\"agents\",tool=\"string-tools\"} 4"
        ));
        assert!(text.contains("operator_route_rules{namespace=\"agents\",route=\"main\"} 5"));
        assert!(text.contains(
            "operator_route_backends_ready{namespace=\"agents\",route=\"main\"} 2"
        ));
        assert!(text.contains(
            "operator_task_phase{namespace=\"agents\",task=\"build-api\",phase=\"Running\"} 1"
        ));
        assert!(text.contains(
            "operator_task_iteration{namespace=\"agents\",task=\"build-api\"} 3"
        ));
        assert!(text.contains(
            "operator_task_total_tasks{namespace=\"agents\",task=\"build-api\"} 6"
        ));
    }

    #[test]
    fn test_series_are_deleted_with_their_resource() {
        let metrics = ControllerMetrics::new();
        metrics.set_agent_metrics("alpha", "agents", "m", "i", true, 1, 1, 0);
        metrics.set_tool_metrics("string-tools", "agents", true, 1);
        metrics.set_route_metrics("main", "agents", 1, 1);
        metrics.set_task_metrics("build-api", "agents", "Running", 0, 0, 0);

        metrics.delete_agent("alpha", "agents");
        metrics.delete_tool("string-tools", "agents");
        metrics.delete_route("main", "agents");
        metrics.delete_task("build-api", "agents");

        let text = metrics.export();
        assert!(!text.contains("agent=\"alpha\""));
        assert!(!text.contains("tool=\"string-tools\""));
        assert!(!text.contains("route=\"main\""));
        assert!(!text.contains("task=\"build-api\""));
    }
}
