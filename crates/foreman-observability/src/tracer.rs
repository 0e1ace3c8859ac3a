use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Well-known attribute keys following the GenAI semantic conventions.
pub mod attr {
    pub const OPERATION_NAME: &str = "gen_ai.operation.name";
    pub const REQUEST_MODEL: &str = "gen_ai.request.model";
    pub const USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
    pub const USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
    pub const AGENT_ID: &str = "gen_ai.agent.id";
    pub const AGENT_NAME: &str = "gen_ai.agent.name";
    pub const TOOL_NAME: &str = "tool.name";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Agent,
    Llm,
    Tool,
    Retrieval,
    Embedding,
}

impl SpanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpanKind::Agent => "agent",
            SpanKind::Llm => "llm",
            SpanKind::Tool => "tool",
            SpanKind::Retrieval => "retrieval",
            SpanKind::Embedding => "embedding",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// One node in a trace tree. A span is owned by the task executing it;
/// attributes may be mutated only while the span is open. Closing happens
/// through [`Tracer::finish`], which consumes the span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub kind: SpanKind,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
    /// Propagated unchanged from parent to child.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub baggage: BTreeMap<String, String>,
}

impl Span {
    fn open(trace_id: String, parent_span_id: Option<String>, kind: SpanKind, name: &str) -> Self {
        Self {
            trace_id,
            span_id: short_id(),
            parent_span_id,
            kind,
            name: name.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::Ok,
            status_message: None,
            attributes: BTreeMap::new(),
            events: Vec::new(),
            baggage: BTreeMap::new(),
        }
    }

    /// Open a child span under this one, propagating the trace id and
    /// baggage.
    pub fn child(&self, kind: SpanKind, name: &str) -> Span {
        let mut span =
            Span::open(self.trace_id.clone(), Some(self.span_id.clone()), kind, name);
        span.baggage = self.baggage.clone();
        span
    }

    pub fn set_baggage(&mut self, key: &str, value: &str) {
        self.baggage.insert(key.to_string(), value.to_string());
    }

    pub fn set_attribute(&mut self, key: &str, value: Value) {
        self.attributes.insert(key.to_string(), value);
    }

    pub fn add_event(&mut self, name: &str, attributes: BTreeMap<String, Value>) {
        self.events.push(SpanEvent {
            name: name.to_string(),
            time: Utc::now(),
            attributes,
        });
    }

    pub fn duration_ms(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1000.0
    }

    fn to_otlp(&self) -> Value {
        let mut out = json!({
            "traceId": self.trace_id,
            "spanId": self.span_id,
            "name": self.name,
            "kind": self.kind.as_str(),
            "startTime": self.start_time.to_rfc3339(),
            "endTime": self.end_time.map(|t| t.to_rfc3339()),
            "attributes": self.attributes,
            "events": self.events.iter().map(|e| json!({
                "name": e.name,
                "time": e.time.to_rfc3339(),
                "attributes": e.attributes,
            })).collect::<Vec<_>>(),
            "status": match self.status {
                SpanStatus::Ok => json!({"code": "OK"}),
                SpanStatus::Error => json!({
                    "code": "ERROR",
                    "message": self.status_message.clone().unwrap_or_default(),
                }),
            },
        });
        if let Some(parent) = &self.parent_span_id {
            out["parentSpanId"] = json!(parent);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerOptions {
    /// Fraction of non-error traces recorded, in [0, 1].
    pub head_sample_rate: f64,
    /// Always record error spans regardless of the head rate.
    pub tail_sample_errors: bool,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            head_sample_rate: 1.0,
            tail_sample_errors: true,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SamplingStats {
    pub sampled: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct TracerInner {
    completed: Vec<Span>,
    open_count: usize,
    stats: SamplingStats,
}

/// Hierarchical span recorder. Cheap to clone; completed spans are appended
/// under a short critical section.
#[derive(Clone)]
pub struct Tracer {
    options: TracerOptions,
    inner: Arc<Mutex<TracerInner>>,
}

impl Tracer {
    pub fn new(options: TracerOptions) -> Self {
        Self {
            options,
            inner: Arc::new(Mutex::new(TracerInner::default())),
        }
    }

    /// Open a root span in a fresh trace.
    pub fn start_trace(&self, kind: SpanKind, name: &str) -> Span {
        self.inner.lock().expect("tracer lock").open_count += 1;
        Span::open(short_id(), None, kind, name)
    }

    /// Open a child of an existing span.
    pub fn start_child(&self, parent: &Span, kind: SpanKind, name: &str) -> Span {
        self.inner.lock().expect("tracer lock").open_count += 1;
        parent.child(kind, name)
    }

    /// Close a span and record it, subject to the sampling policy.
    pub fn finish(&self, mut span: Span, status: SpanStatus) {
        span.status = status;
        span.end_time = Some(Utc::now());
        let mut inner = self.inner.lock().expect("tracer lock");
        inner.open_count = inner.open_count.saturating_sub(1);
        if self.should_sample(status == SpanStatus::Error) {
            inner.stats.sampled += 1;
            inner.completed.push(span);
        } else {
            inner.stats.dropped += 1;
        }
    }

    pub fn finish_with_error(&self, mut span: Span, message: impl Into<String>) {
        span.status_message = Some(message.into());
        self.finish(span, SpanStatus::Error);
    }

    fn should_sample(&self, is_error: bool) -> bool {
        if is_error && self.options.tail_sample_errors {
            return true;
        }
        if self.options.head_sample_rate >= 1.0 {
            return true;
        }
        rand::thread_rng().gen::<f64>() < self.options.head_sample_rate
    }

    pub fn completed_spans(&self) -> Vec<Span> {
        self.inner.lock().expect("tracer lock").completed.clone()
    }

    pub fn open_span_count(&self) -> usize {
        self.inner.lock().expect("tracer lock").open_count
    }

    pub fn sampling_stats(&self) -> SamplingStats {
        self.inner.lock().expect("tracer lock").stats.clone()
    }

    /// Export completed spans in an OTLP-shaped JSON structure.
    pub fn export_spans(&self) -> Vec<Value> {
        self.inner
            .lock()
            .expect("tracer lock")
            .completed
            .iter()
            .map(Span::to_otlp)
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("tracer lock");
        inner.completed.clear();
        inner.stats = SamplingStats::default();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(TracerOptions::default())
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_spans_share_the_trace_and_reference_the_parent() {
        let tracer = Tracer::default();
        let mut root = tracer.start_trace(SpanKind::Agent, "execute");
        root.set_baggage("session_id", "ses-1");
        let child = tracer.start_child(&root, SpanKind::Llm, "generate");
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_eq!(child.baggage.get("session_id").map(String::as_str), Some("ses-1"));
        tracer.finish(child, SpanStatus::Ok);
        tracer.finish(root, SpanStatus::Ok);
        assert_eq!(tracer.completed_spans().len(), 2);
        assert_eq!(tracer.open_span_count(), 0);
    }

    #[test]
    fn children_close_before_parents() {
        let tracer = Tracer::default();
        let root = tracer.start_trace(SpanKind::Agent, "execute");
        let child = tracer.start_child(&root, SpanKind::Tool, "read_file");
        tracer.finish(child, SpanStatus::Ok);
        tracer.finish(root, SpanStatus::Ok);

        let spans = tracer.completed_spans();
        let child_end = spans[0].end_time.expect("child end");
        let root_end = spans[1].end_time.expect("root end");
        assert!(root_end >= child_end);
    }

    #[test]
    fn errors_survive_a_zero_head_sample_rate() {
        let tracer = Tracer::new(TracerOptions {
            head_sample_rate: 0.0,
            tail_sample_errors: true,
        });
        let ok_span = tracer.start_trace(SpanKind::Agent, "dropped");
        tracer.finish(ok_span, SpanStatus::Ok);
        let err_span = tracer.start_trace(SpanKind::Agent, "kept");
        tracer.finish_with_error(err_span, "boom");

        let spans = tracer.completed_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "kept");
        let stats = tracer.sampling_stats();
        assert_eq!(stats.sampled, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn otlp_export_carries_status_and_attributes() {
        let tracer = Tracer::default();
        let mut span = tracer.start_trace(SpanKind::Llm, "generate");
        span.set_attribute(attr::REQUEST_MODEL, serde_json::json!("frontier-1"));
        span.set_attribute(attr::USAGE_INPUT_TOKENS, serde_json::json!(128));
        tracer.finish(span, SpanStatus::Ok);

        let exported = tracer.export_spans();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0]["kind"], "llm");
        assert_eq!(exported[0]["attributes"][attr::REQUEST_MODEL], "frontier-1");
        assert_eq!(exported[0]["status"]["code"], "OK");
        assert!(exported[0].get("parentSpanId").is_none());
    }
}
