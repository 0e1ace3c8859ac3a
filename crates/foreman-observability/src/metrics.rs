use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

/// Standard metric names following the GenAI semantic conventions.
pub mod metric {
    pub const TOKEN_USAGE: &str = "gen_ai.client.token.usage";
    pub const OPERATION_DURATION: &str = "gen_ai.client.operation.duration";
    pub const TIME_TO_FIRST_TOKEN: &str = "gen_ai.server.time_to_first_token";
    pub const TOOL_INVOCATIONS: &str = "agent.tool.invocations";
    pub const ERROR_COUNT: &str = "agent.error.count";
}

/// Default histogram bucket upper bounds, in milliseconds.
pub const DEFAULT_BUCKETS_MS: [f64; 14] = [
    5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<u64>,
    overflow: u64,
    pub sum: f64,
    pub count: u64,
}

impl Histogram {
    pub fn new(buckets: &[f64]) -> Self {
        Self {
            buckets: buckets.to_vec(),
            counts: vec![0; buckets.len()],
            overflow: 0,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (idx, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                self.counts[idx] += 1;
            }
        }
        self.overflow += 1;
    }

    /// Bucket-based percentile estimate; returns the upper bound of the
    /// first bucket whose cumulative count reaches the target rank.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = ((self.count as f64) * p / 100.0).ceil() as u64;
        for (idx, bound) in self.buckets.iter().enumerate() {
            if self.counts[idx] >= target {
                return *bound;
            }
        }
        *self.buckets.last().unwrap_or(&0.0)
    }

    fn cumulative(&self) -> Vec<(f64, u64)> {
        self.buckets
            .iter()
            .copied()
            .zip(self.counts.iter().copied())
            .collect()
    }
}

type LabelKey = String;

#[derive(Default)]
struct MetricsInner {
    counters: BTreeMap<String, BTreeMap<LabelKey, f64>>,
    gauges: BTreeMap<String, BTreeMap<LabelKey, f64>>,
    histograms: BTreeMap<String, BTreeMap<LabelKey, Histogram>>,
}

/// Counter/gauge/histogram aggregation with a Prometheus text exposition.
#[derive(Clone)]
pub struct MetricsCollector {
    buckets: Vec<f64>,
    inner: Arc<Mutex<MetricsInner>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_buckets(&DEFAULT_BUCKETS_MS)
    }

    pub fn with_buckets(buckets: &[f64]) -> Self {
        Self {
            buckets: buckets.to_vec(),
            inner: Arc::new(Mutex::new(MetricsInner::default())),
        }
    }

    pub fn increment_counter(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = label_key(labels);
        let mut inner = self.inner.lock().expect("metrics lock");
        *inner
            .counters
            .entry(name.to_string())
            .or_default()
            .entry(key)
            .or_insert(0.0) += value;
    }

    pub fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = label_key(labels);
        let mut inner = self.inner.lock().expect("metrics lock");
        inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .insert(key, value);
    }

    pub fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = label_key(labels);
        let mut inner = self.inner.lock().expect("metrics lock");
        let buckets = self.buckets.clone();
        inner
            .histograms
            .entry(name.to_string())
            .or_default()
            .entry(key)
            .or_insert_with(|| Histogram::new(&buckets))
            .observe(value);
    }

    pub fn record_token_usage(
        &self,
        operation: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        self.increment_counter(
            metric::TOKEN_USAGE,
            input_tokens as f64,
            &[
                ("gen_ai.operation.name", operation),
                ("gen_ai.request.model", model),
                ("token_type", "input"),
            ],
        );
        self.increment_counter(
            metric::TOKEN_USAGE,
            output_tokens as f64,
            &[
                ("gen_ai.operation.name", operation),
                ("gen_ai.request.model", model),
                ("token_type", "output"),
            ],
        );
    }

    pub fn record_latency(&self, operation: &str, model: &str, duration_ms: f64) {
        self.observe_histogram(
            metric::OPERATION_DURATION,
            duration_ms,
            &[
                ("gen_ai.operation.name", operation),
                ("gen_ai.request.model", model),
            ],
        );
    }

    pub fn record_ttft(&self, model: &str, ttft_ms: f64) {
        self.observe_histogram(
            metric::TIME_TO_FIRST_TOKEN,
            ttft_ms,
            &[("gen_ai.request.model", model)],
        );
    }

    pub fn record_tool_invocation(&self, tool_name: &str, success: bool) {
        self.increment_counter(
            metric::TOOL_INVOCATIONS,
            1.0,
            &[
                ("tool_name", tool_name),
                ("status", if success { "success" } else { "error" }),
            ],
        );
    }

    pub fn record_error(&self, agent_id: &str, error_type: &str) {
        self.increment_counter(
            metric::ERROR_COUNT,
            1.0,
            &[("agent_id", agent_id), ("error_type", error_type)],
        );
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = label_key(labels);
        self.inner
            .lock()
            .expect("metrics lock")
            .counters
            .get(name)
            .and_then(|by_label| by_label.get(&key))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = label_key(labels);
        self.inner
            .lock()
            .expect("metrics lock")
            .gauges
            .get(name)
            .and_then(|by_label| by_label.get(&key))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn histogram_stats(&self, name: &str, labels: &[(&str, &str)]) -> Value {
        let key = label_key(labels);
        let inner = self.inner.lock().expect("metrics lock");
        let Some(hist) = inner
            .histograms
            .get(name)
            .and_then(|by_label| by_label.get(&key))
        else {
            return json!({"count": 0, "sum": 0.0, "p50": 0.0, "p90": 0.0, "p99": 0.0});
        };
        json!({
            "count": hist.count,
            "sum": hist.sum,
            "mean": if hist.count > 0 { hist.sum / hist.count as f64 } else { 0.0 },
            "p50": hist.percentile(50.0),
            "p90": hist.percentile(90.0),
            "p99": hist.percentile(99.0),
        })
    }

    /// Serialize all metrics in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let inner = self.inner.lock().expect("metrics lock");
        let mut out = String::new();

        for (name, by_label) in &inner.counters {
            let sanitized = sanitize_metric_name(name);
            out.push_str(&format!("# TYPE {sanitized} counter\n"));
            for (labels, value) in by_label {
                out.push_str(&format!("{sanitized}{} {value}\n", render_labels(labels)));
            }
        }
        for (name, by_label) in &inner.gauges {
            let sanitized = sanitize_metric_name(name);
            out.push_str(&format!("# TYPE {sanitized} gauge\n"));
            for (labels, value) in by_label {
                out.push_str(&format!("{sanitized}{} {value}\n", render_labels(labels)));
            }
        }
        for (name, by_label) in &inner.histograms {
            let sanitized = sanitize_metric_name(name);
            out.push_str(&format!("# TYPE {sanitized} histogram\n"));
            for (labels, hist) in by_label {
                for (bound, count) in hist.cumulative() {
                    out.push_str(&format!(
                        "{sanitized}_bucket{} {count}\n",
                        render_labels_with(labels, &[("le", &format_bound(bound))]),
                    ));
                }
                out.push_str(&format!(
                    "{sanitized}_bucket{} {}\n",
                    render_labels_with(labels, &[("le", "+Inf")]),
                    hist.overflow,
                ));
                out.push_str(&format!(
                    "{sanitized}_sum{} {}\n",
                    render_labels(labels),
                    hist.sum
                ));
                out.push_str(&format!(
                    "{sanitized}_count{} {}\n",
                    render_labels(labels),
                    hist.count
                ));
            }
        }
        out
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("metrics lock");
        inner.counters.clear();
        inner.gauges.clear();
        inner.histograms.clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn label_key(labels: &[(&str, &str)]) -> String {
    let mut pairs = labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join(",")
}

fn sanitize_metric_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn render_labels(key: &str) -> String {
    render_labels_with(key, &[])
}

fn render_labels_with(key: &str, extra: &[(&str, &str)]) -> String {
    let mut parts = Vec::new();
    for pair in key.split(',').filter(|p| !p.is_empty()) {
        if let Some((k, v)) = pair.split_once('=') {
            parts.push(format!("{}=\"{}\"", sanitize_metric_name(k), v));
        }
    }
    for (k, v) in extra {
        parts.push(format!("{k}=\"{v}\""));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

fn format_bound(bound: f64) -> String {
    if bound.fract() == 0.0 {
        format!("{}", bound as i64)
    } else {
        format!("{bound}")
    }
}
