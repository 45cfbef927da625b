//! Prometheus metrics for the gateway process.
//!
//! Every rejection path carries an `error_type` label so operators can
//! tell invalid requests from admission rejects from worker failures.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Default)]
struct DurationStat {
    sum: f64,
    count: u64,
}

/// Central collector for the gateway process.
#[derive(Default)]
pub struct GatewayMetrics {
    requests_total: Mutex<BTreeMap<(String, String, String), u64>>,
    request_duration: Mutex<BTreeMap<String, DurationStat>>,
    request_errors_total: Mutex<BTreeMap<(String, String, String), u64>>,
    route_matches_total: Mutex<BTreeMap<String, u64>>,
    route_no_match_total: Mutex<u64>,
    backend_forwards_total: Mutex<BTreeMap<(String, String), u64>>,
    circuit_active: Mutex<BTreeMap<String, i64>>,
    circuit_waiting: Mutex<BTreeMap<String, i64>>,
    circuit_rejections_total: Mutex<BTreeMap<(String, String), u64>>,
    mcp_requests_total: Mutex<BTreeMap<(String, String), u64>>,
    mcp_request_duration: Mutex<BTreeMap<String, DurationStat>>,
    mcp_tools_list_total: Mutex<u64>,
    mcp_tools_call_total: Mutex<BTreeMap<(String, String), u64>>,
    mcp_connections_active: Mutex<BTreeMap<String, i64>>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, agent: &str, route: &str, status: u16, seconds: f64) {
        *self
            .requests_total
            .lock()
            .entry((agent.to_string(), route.to_string(), status.to_string()))
            .or_insert(0) += 1;
        let mut durations = self.request_duration.lock();
        let stat = durations.entry(route.to_string()).or_default();
        stat.sum += seconds;
        stat.count += 1;
    }

    pub fn record_request_error(&self, agent: &str, route: &str, error_type: &str) {
        *self
            .request_errors_total
            .lock()
            .entry((agent.to_string(), route.to_string(), error_type.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_route_match(&self, route: &str) {
        *self
            .route_matches_total
            .lock()
            .entry(route.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_route_no_match(&self) {
        *self.route_no_match_total.lock() += 1;
    }

    pub fn record_backend_forward(&self, agent: &str, namespace: &str) {
        *self
            .backend_forwards_total
            .lock()
            .entry((agent.to_string(), namespace.to_string()))
            .or_insert(0) += 1;
    }

    pub fn set_circuit_active(&self, route: &str, active: i64) {
        self.circuit_active.lock().insert(route.to_string(), active);
    }

    pub fn set_circuit_waiting(&self, route: &str, waiting: i64) {
        self.circuit_waiting.lock().insert(route.to_string(), waiting);
    }

    pub fn record_circuit_rejection(&self, route: &str, reason: &str) {
        *self
            .circuit_rejections_total
            .lock()
            .entry((route.to_string(), reason.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_mcp_request(&self, method: &str, transport: &str, seconds: f64) {
        *self
            .mcp_requests_total
            .lock()
            .entry((method.to_string(), transport.to_string()))
            .or_insert(0) += 1;
        let mut durations = self.mcp_request_duration.lock();
        let stat = durations.entry(method.to_string()).or_default();
        stat.sum += seconds;
        stat.count += 1;
    }

    pub fn record_mcp_tools_list(&self) {
        *self.mcp_tools_list_total.lock() += 1;
    }

    pub fn record_mcp_tools_call(&self, agent: &str, tool: &str) {
        *self
            .mcp_tools_call_total
            .lock()
            .entry((agent.to_string(), tool.to_string()))
            .or_insert(0) += 1;
    }

    pub fn set_mcp_connections(&self, transport: &str, count: i64) {
        self.mcp_connections_active
            .lock()
            .insert(transport.to_string(), count);
    }

    /// Snapshot of a rejection counter, for tests and debugging.
    pub fn circuit_rejections(&self, route: &str, reason: &str) -> u64 {
        self.circuit_rejections_total
            .lock()
            .get(&(route.to_string(), reason.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Render every collector in Prometheus text exposition format.
    pub fn export(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE gateway_requests_total counter\n");
        for ((agent, route, status), value) in self.requests_total.lock().iter() {
            let _ = writeln!(
                out,
                "gateway_requests_total{{agent=\"{agent}\",route=\"{route}\",status=\"{status}\"}} {value}"
            );
        }

        out.push_str("# TYPE gateway_request_duration_seconds summary\n");
        for (route, stat) in self.request_duration.lock().iter() {
            let _ = writeln!(
                out,
                "gateway_request_duration_seconds_sum{{route=\"{route}\"}} {}",
                stat.sum
            );
            let _ = writeln!(
                out,
                "gateway_request_duration_seconds_count{{route=\"{route}\"}} {}",
                stat.count
            );
        }

        out.push_str("# TYPE gateway_request_errors_total counter\n");
        for ((agent, route, error_type), value) in self.request_errors_total.lock().iter() {
            let _ = writeln!(
                out,
                "gateway_request_errors_total{{agent=\"{agent}\",route=\"{route}\",error_type=\"{error_type}\"}} {value}"
            );
        }

        out.push_str("# TYPE gateway_route_matches_total counter\n");
        for (route, value) in self.route_matches_total.lock().iter() {
            let _ = writeln!(out, "gateway_route_matches_total{{route=\"{route}\"}} {value}");
        }

        out.push_str("# TYPE gateway_route_no_match_total counter\n");
        let _ = writeln!(out, "gateway_route_no_match_total {}", self.route_no_match_total.lock());

        out.push_str("# TYPE gateway_backend_forwards_total counter\n");
        for ((agent, namespace), value) in self.backend_forwards_total.lock().iter() {
            let _ = writeln!(
                out,
                "gateway_backend_forwards_total{{agent=\"{agent}\",namespace=\"{namespace}\"}} {value}"
            );
        }

        out.push_str("# TYPE circuit_breaker_active gauge\n");
        for (route, value) in self.circuit_active.lock().iter() {
            let _ = writeln!(out, "circuit_breaker_active{{route=\"{route}\"}} {value}");
        }

        out.push_str("# TYPE circuit_breaker_waiting gauge\n");
        for (route, value) in self.circuit_waiting.lock().iter() {
            let _ = writeln!(out, "circuit_breaker_waiting{{route=\"{route}\"}} {value}");
        }

        out.push_str("# TYPE circuit_breaker_rejections_total counter\n");
        for ((route, reason), value) in self.circuit_rejections_total.lock().iter() {
            let _ = writeln!(
                out,
                "circuit_breaker_rejections_total{{route=\"{route}\",reason=\"{reason}\"}} {value}"
            );
        }

        out.push_str("# TYPE mcp_requests_total counter\n");
        for ((method, transport), value) in self.mcp_requests_total.lock().iter() {
            let _ = writeln!(
                out,
                "mcp_requests_total{{method=\"{method}\",transport=\"{transport}\"}} {value}"
            );
        }

        out.push_str("# TYPE mcp_request_duration_seconds summary\n");
        for (method, stat) in self.mcp_request_duration.lock().iter() {
            let _ = writeln!(
                out,
                "mcp_request_duration_seconds_sum{{method=\"{method}\"}} {}",
                stat.sum
            );
            let _ = writeln!(
                out,
                "mcp_request_duration_seconds_count{{method=\"{method}\"}} {}",
                stat.count
            );
        }

        out.push_str("# TYPE mcp_tools_list_total counter\n");
        let _ = writeln!(out, "mcp_tools_list_total {}", self.mcp_tools_list_total.lock());

        out.push_str("# TYPE mcp_tools_call_total counter\n");
        for ((agent, tool), value) in self.mcp_tools_call_total.lock().iter() {
            let _ = writeln!(
                out,
                "mcp_tools_call_total{{agent=\"{agent}\",tool=\"{tool}\"}} {value}"
            );
        }

        out.push_str("# TYPE mcp_connections_active gauge\n");
        for (transport, value) in self.mcp_connections_active.lock().iter() {
            let _ = writeln!(
                out,
                "mcp_connections_active{{transport=\"{transport}\"}} {value}"
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_label_is_exported() {
        let metrics = GatewayMetrics::new();
        metrics.record_request_error("alpha", "r", "queue_full");
        metrics.record_circuit_rejection("r", "queue_full");

        let text = metrics.export();
        assert!(text.contains(
            "gateway_request_errors_total{agent=\"alpha\",route=\"r\",error_type=\"queue_full\"} 1"
        ));
        assert!(text.contains(
            "circuit_breaker_rejections_total{route=\"r\",reason=\"queue_full\"} 1"
        ));
    }

    #[test]
    fn test_request_counters_accumulate() {
        let metrics = GatewayMetrics::new();
        metrics.record_request("alpha", "r", 200, 0.05);
        metrics.record_request("alpha", "r", 200, 0.10);

        let text = metrics.export();
        assert!(text.contains(
            "gateway_requests_total{agent=\"alpha\",route=\"r\",status=\"200\"} 2"
        ));
        assert!(text.contains("gateway_request_duration_seconds_count{route=\"r\"} 2"));
    }
}
