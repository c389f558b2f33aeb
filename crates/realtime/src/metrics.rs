use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RealtimeMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_events_total: Mutex<HashMap<String, u64>>,
    ws_event_errors_total: Mutex<HashMap<String, u64>>,
    handshake_rejections_total: Mutex<HashMap<String, u64>>,
    retry_conflicts_total: Mutex<HashMap<String, u64>>,
    retry_exhausted_total: Mutex<HashMap<String, u64>>,
    reconciliations_total: Mutex<HashMap<String, u64>>,
    released_tasks_total: AtomicU64,
    open_connections: AtomicI64,
}

const RECONCILIATION_OUTCOMES: [&str; 3] = ["cleared", "skipped_relaxed", "failed"];
static GLOBAL_METRICS: OnceLock<Arc<RealtimeMetrics>> = OnceLock::new();

impl Default for RealtimeMetrics {
    fn default() -> Self {
        let mut reconciliations_total = HashMap::new();
        for outcome in RECONCILIATION_OUTCOMES {
            reconciliations_total.insert(outcome.to_string(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_events_total: Mutex::new(HashMap::new()),
            ws_event_errors_total: Mutex::new(HashMap::new()),
            handshake_rejections_total: Mutex::new(HashMap::new()),
            retry_conflicts_total: Mutex::new(HashMap::new()),
            retry_exhausted_total: Mutex::new(HashMap::new()),
            reconciliations_total: Mutex::new(reconciliations_total),
            released_tasks_total: AtomicU64::new(0),
            open_connections: AtomicI64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RealtimeMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RealtimeMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_event(event: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_event(event, is_error);
    }
}

pub fn record_handshake_rejection(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_handshake_rejection(reason);
    }
}

pub fn increment_retry_conflicts(operation: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_retry_conflicts(operation);
    }
}

pub fn increment_retry_exhausted(operation: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_retry_exhausted(operation);
    }
}

pub fn record_reconciliation(outcome: &str, released_tasks: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_reconciliation(outcome, released_tasks);
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.open_connections.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RealtimeMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_event(&self, event: &str, is_error: bool) {
        let label = normalize_label(event);
        increment_label_counter(&self.ws_events_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_event_errors_total, &label, 1);
        }
    }

    pub fn record_handshake_rejection(&self, reason: &str) {
        increment_label_counter(&self.handshake_rejections_total, &normalize_label(reason), 1);
    }

    pub fn increment_retry_conflicts(&self, operation: &str) {
        increment_label_counter(&self.retry_conflicts_total, &normalize_label(operation), 1);
    }

    pub fn increment_retry_exhausted(&self, operation: &str) {
        increment_label_counter(&self.retry_exhausted_total, &normalize_label(operation), 1);
    }

    pub fn record_reconciliation(&self, outcome: &str, released_tasks: u64) {
        let normalized = normalize_label(outcome);
        let label = if RECONCILIATION_OUTCOMES.contains(&normalized.as_str()) {
            normalized
        } else {
            "unknown".to_string()
        };
        increment_label_counter(&self.reconciliations_total, &label, 1);
        self.released_tasks_total.fetch_add(released_tasks, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP realtime_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE realtime_request_rate_total counter\n");
        append_counter_lines(&mut output, "realtime_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP realtime_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE realtime_request_errors_total counter\n");
        append_counter_lines(
            &mut output,
            "realtime_request_errors_total",
            &self.request_errors_total,
        );

        output.push_str("# HELP realtime_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE realtime_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "realtime_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP realtime_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE realtime_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "realtime_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP realtime_ws_events_total Total inbound channel events by name.\n");
        output.push_str("# TYPE realtime_ws_events_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_ws_events_total",
            "event",
            &self.ws_events_total,
        );

        output.push_str(
            "# HELP realtime_ws_event_errors_total Inbound channel events dropped by name.\n",
        );
        output.push_str("# TYPE realtime_ws_event_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_ws_event_errors_total",
            "event",
            &self.ws_event_errors_total,
        );

        output.push_str(
            "# HELP realtime_handshake_rejections_total Rejected channel handshakes by reason.\n",
        );
        output.push_str("# TYPE realtime_handshake_rejections_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_handshake_rejections_total",
            "reason",
            &self.handshake_rejections_total,
        );

        output.push_str(
            "# HELP realtime_retry_conflicts_total Version conflicts retried by operation.\n",
        );
        output.push_str("# TYPE realtime_retry_conflicts_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_retry_conflicts_total",
            "operation",
            &self.retry_conflicts_total,
        );

        output.push_str(
            "# HELP realtime_retry_exhausted_total Writes abandoned after the final conflicting attempt.\n",
        );
        output.push_str("# TYPE realtime_retry_exhausted_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_retry_exhausted_total",
            "operation",
            &self.retry_exhausted_total,
        );

        output.push_str(
            "# HELP realtime_reconciliations_total Stale-session reconciliations by outcome.\n",
        );
        output.push_str("# TYPE realtime_reconciliations_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_reconciliations_total",
            "outcome",
            &self.reconciliations_total,
        );

        output.push_str(
            "# HELP realtime_released_tasks_total Generation tasks released by reconciliation.\n",
        );
        output.push_str("# TYPE realtime_released_tasks_total counter\n");
        output.push_str(&format!(
            "realtime_released_tasks_total {}\n",
            self.released_tasks_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP realtime_open_connections Currently open channel connections.\n");
        output.push_str("# TYPE realtime_open_connections gauge\n");
        output.push_str(&format!(
            "realtime_open_connections {}\n",
            self.open_connections.load(Ordering::SeqCst).max(0)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::RealtimeMetrics;
    use std::sync::atomic::Ordering;

    #[test]
    fn render_prometheus_includes_channel_and_tracking_metrics() {
        let metrics = RealtimeMetrics::default();
        metrics.record_http_request(
            "get",
            "/v1/usage/presence/5f0c6f0e-8d7c-4d4e-9c63-1b2a3c4d5e6f",
            200,
            12,
        );
        metrics.record_http_request("GET", "/v1/usage/modules", 401, 3);
        metrics.record_ws_event("usage-time-start", false);
        metrics.record_ws_event("usage-time-start", true);
        metrics.record_ws_event("  ", true);
        metrics.record_handshake_rejection("missing_token");
        metrics.increment_retry_conflicts("presence_connect");
        metrics.increment_retry_conflicts("presence_connect");
        metrics.increment_retry_exhausted("module_usage_end");
        metrics.record_reconciliation("cleared", 4);
        metrics.record_reconciliation("sideways", 0);
        metrics.open_connections.fetch_add(2, Ordering::SeqCst);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains(
            "realtime_request_rate_total{method=\"GET\",endpoint=\"/v1/usage/presence/{uuid}\"} 1"
        ));
        assert!(rendered.contains(
            "realtime_request_errors_total{method=\"GET\",endpoint=\"/v1/usage/modules\"} 1"
        ));
        assert!(rendered.contains("realtime_ws_events_total{event=\"usage-time-start\"} 2"));
        assert!(rendered.contains("realtime_ws_event_errors_total{event=\"usage-time-start\"} 1"));
        assert!(rendered.contains("realtime_ws_event_errors_total{event=\"unknown\"} 1"));
        assert!(rendered.contains("realtime_handshake_rejections_total{reason=\"missing_token\"} 1"));
        assert!(rendered.contains("realtime_retry_conflicts_total{operation=\"presence_connect\"} 2"));
        assert!(rendered.contains("realtime_retry_exhausted_total{operation=\"module_usage_end\"} 1"));
        assert!(rendered.contains("realtime_reconciliations_total{outcome=\"cleared\"} 1"));
        assert!(rendered.contains("realtime_reconciliations_total{outcome=\"skipped_relaxed\"} 0"));
        assert!(rendered.contains("realtime_reconciliations_total{outcome=\"unknown\"} 1"));
        assert!(rendered.contains("realtime_released_tasks_total 4"));
        assert!(rendered.contains("realtime_open_connections 2"));
    }
}
