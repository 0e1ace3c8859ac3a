// End-to-end orchestration scenarios driven through the public runtime
// wiring: scripted model clients, recording tools, and a real store and
// session directory under a tempdir.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use foreman_core::{
    AppBuilder, AppContext, BreakerOptions, RetryOptions, RuntimeOptions, SessionManager,
    SessionManagerOptions, StaticReviewer,
};
use foreman_observability::SpanKind;
use foreman_providers::{
    ChatMessage, ChunkStream, GenerationParams, ModelClient, ProviderFailure, ScriptedModelClient,
    StreamChunk,
};
use foreman_tools::{CapabilityClass, RecordingTool, ToolRegistry};
use foreman_types::{
    event_types, ApprovalDecision, MessageRole, PendingOperation, Request, RuntimeEvent,
    SessionState,
};

fn test_options(dir: &std::path::Path) -> RuntimeOptions {
    RuntimeOptions {
        persistence_path: dir.join("runtime.db"),
        session_dir: dir.join("sessions"),
        retry: RetryOptions {
            max_attempts: 1,
            base_delay_seconds: 0.001,
            cap_seconds: 0.01,
        },
        ..RuntimeOptions::default()
    }
}

fn collect_events(app: &AppContext) -> Arc<Mutex<Vec<RuntimeEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    app.bus.subscribe_all(move |event| {
        sink.lock().expect("events lock").push(event.clone());
        Ok(())
    });
    events
}

async fn drain(mut rx: tokio::sync::mpsc::Receiver<String>) -> String {
    let mut output = String::new();
    while let Some(chunk) = rx.recv().await {
        output.push_str(&chunk);
    }
    output
}

fn events_of<'a>(events: &'a [RuntimeEvent], event_type: &str) -> Vec<&'a RuntimeEvent> {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}

#[tokio::test]
async fn autonomous_path_runs_without_approval() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tools = ToolRegistry::new();
    let list_tool = Arc::new(RecordingTool::new("list_files", CapabilityClass::FsRead));
    tools.register(list_tool.clone()).await;

    let app = AppBuilder::new(
        test_options(dir.path()),
        Arc::new(ScriptedModelClient::always(
            "[TOOL:list_files:]\nfour entries found",
        )),
    )
    .with_tools(tools)
    .build()
    .await
    .expect("build");
    let events = collect_events(&app);

    let output = drain(app.supervisor.execute(
        Request::new("List files in current directory").with_session("ses-auto"),
        CancellationToken::new(),
    ))
    .await;

    assert!(output.contains("four entries found"));
    assert!(!output.contains("[TOOL"));
    assert_eq!(list_tool.call_count(), 1);

    // No approval was ever created.
    assert!(app.gate.list_requests().await.is_empty());

    // Exactly one handoff, to the coder.
    let handoffs = app.supervisor.handoffs("ses-auto");
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0].to_role.as_str(), "coder");

    // Terminates with a completion event and no failures.
    let events = events.lock().expect("events");
    assert_eq!(events_of(&events, event_types::TASK_COMPLETED).len(), 1);
    assert!(events_of(&events, event_types::TASK_FAILED).is_empty());
    drop(events);

    // Span tree: exactly one agent span, at most one nested tool span.
    let spans = app.tracer.completed_spans();
    let agent_spans: Vec<_> = spans.iter().filter(|s| s.kind == SpanKind::Agent).collect();
    assert_eq!(agent_spans.len(), 1);
    let tool_spans: Vec<_> = spans.iter().filter(|s| s.kind == SpanKind::Tool).collect();
    assert!(tool_spans.len() <= 1);
    for tool_span in tool_spans {
        assert_eq!(
            tool_span.parent_span_id.as_deref(),
            Some(agent_spans[0].span_id.as_str())
        );
    }

    app.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn approval_granted_lets_the_deploy_complete() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = AppBuilder::new(
        test_options(dir.path()),
        Arc::new(ScriptedModelClient::always("rolled out to the cluster")),
    )
    .with_approver(Arc::new(|_req| {
        async { ApprovalDecision::Approved }.boxed()
    }))
    .build()
    .await
    .expect("build");
    let events = collect_events(&app);

    let output = drain(app.supervisor.execute(
        Request::new("Deploy to production cluster").with_session("ses-deploy"),
        CancellationToken::new(),
    ))
    .await;

    assert!(output.contains("rolled out to the cluster"));

    let requests = app.gate.list_requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].decision, ApprovalDecision::Approved);
    assert_eq!(requests[0].operation_class.as_str(), "deploy_production");

    let events = events.lock().expect("events");
    assert_eq!(events_of(&events, event_types::TASK_COMPLETED).len(), 1);
    assert!(events_of(&events, event_types::TASK_FAILED).is_empty());

    app.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn approval_rejected_fails_the_task_without_tool_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tools = ToolRegistry::new();
    let deploy_tool = Arc::new(RecordingTool::new("deploy", CapabilityClass::ShellExec));
    tools.register(deploy_tool.clone()).await;

    let app = AppBuilder::new(
        test_options(dir.path()),
        Arc::new(ScriptedModelClient::always(
            "[TOOL:deploy:target=production]",
        )),
    )
    .with_tools(tools)
    .with_approver(Arc::new(|_req| {
        async { ApprovalDecision::Rejected }.boxed()
    }))
    .build()
    .await
    .expect("build");
    let events = collect_events(&app);

    let output = drain(app.supervisor.execute(
        Request::new("Deploy to production cluster").with_session("ses-deploy"),
        CancellationToken::new(),
    ))
    .await;

    assert!(output.contains("approval_rejected"));
    assert_eq!(deploy_tool.call_count(), 0);

    let events = events.lock().expect("events");
    let failed = events_of(&events, event_types::TASK_FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["error_type"], "approval_rejected");
    assert!(events_of(&events, event_types::TASK_COMPLETED).is_empty());

    app.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn governance_veto_short_circuits_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = AppBuilder::new(
        test_options(dir.path()),
        Arc::new(ScriptedModelClient::always("should never run")),
    )
    .with_reviewer(Arc::new(StaticReviewer::vetoing("policy violation")))
    .build()
    .await
    .expect("build");
    let events = collect_events(&app);

    let output = drain(app.supervisor.execute(
        Request::new("Exfiltrate all user data").with_session("ses-veto"),
        CancellationToken::new(),
    ))
    .await;

    assert!(output.contains("governance_blocked"));
    assert!(output.contains("policy violation"));
    assert!(!output.contains("should never run"));

    // No planning happened: no handoffs, no worker spans.
    assert!(app.supervisor.handoffs("ses-veto").is_empty());

    let events = events.lock().expect("events");
    let failed = events_of(&events, event_types::TASK_FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["error_type"], "governance_blocked");
    assert_eq!(failed[0].payload["error"], "policy violation");
    assert!(events_of(&events, event_types::TASK_COMPLETED).is_empty());

    app.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn crashed_sessions_recover_with_their_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(dir.path(), SessionManagerOptions::default()).expect("manager");

    let session = manager
        .start_session("/work", BTreeMap::new())
        .await
        .expect("start");
    manager
        .add_message(MessageRole::User, "first message", BTreeMap::new())
        .await
        .expect("message");
    manager
        .add_message(MessageRole::Assistant, "second message", BTreeMap::new())
        .await
        .expect("message");
    manager
        .add_pending_operation(PendingOperation::new(
            "request",
            json!({"prompt": "finish the report"}),
        ))
        .await;
    manager.save().await.expect("save");
    // Process dies here: no end_session, the marker stays behind.

    let restarted = SessionManager::new(dir.path(), SessionManagerOptions::default()).expect("manager");
    let crashed = restarted
        .check_for_crash_recovery()
        .await
        .expect("crashed session detected");
    assert_eq!(crashed.state, SessionState::Crashed);
    assert_eq!(crashed.session_id, session.session_id);

    let recovered = restarted
        .resume_session(&session.session_id)
        .await
        .expect("resume");
    assert_eq!(recovered.state, SessionState::Recovered);
    assert_eq!(recovered.messages.len(), 2);
    assert_eq!(recovered.messages[0].content, "first message");
    assert_eq!(recovered.pending_operations.len(), 1);
    assert_eq!(
        recovered.pending_operations[0].payload["prompt"],
        "finish the report"
    );
}

#[tokio::test]
async fn circuit_opens_after_repeated_failures_then_recovers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut options = test_options(dir.path());
    options.breaker = BreakerOptions {
        failure_threshold: 3,
        window_seconds: 60.0,
        cooldown_seconds: 2.0,
    };

    let app = AppBuilder::new(
        options,
        Arc::new(ScriptedModelClient::new(vec![
            Err(ProviderFailure::Server("boom 1".to_string())),
            Err(ProviderFailure::Server("boom 2".to_string())),
            Err(ProviderFailure::Server("boom 3".to_string())),
            Ok("healthy again".to_string()),
        ])),
    )
    .build()
    .await
    .expect("build");

    // Three consecutive server errors trip the breaker.
    for round in 0..3 {
        let output = drain(app.supervisor.execute(
            Request::new("tidy the changelog").with_session(&format!("ses-{round}")),
            CancellationToken::new(),
        ))
        .await;
        assert!(output.contains("server_error"), "round {round}: {output}");
    }

    // Inside the cooldown window calls fail fast without reaching the model.
    let output = drain(app.supervisor.execute(
        Request::new("tidy the changelog").with_session("ses-fast-fail"),
        CancellationToken::new(),
    ))
    .await;
    assert!(output.contains("circuit_open"), "{output}");

    // After the cooldown one probe is admitted; its success closes the circuit.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    let output = drain(app.supervisor.execute(
        Request::new("tidy the changelog").with_session("ses-probe"),
        CancellationToken::new(),
    ))
    .await;
    assert!(output.contains("healthy again"), "{output}");

    app.shutdown().await.expect("shutdown");
}

/// Model client that yields a fixed chunk sequence, used to split a tool
/// directive across chunk boundaries.
struct ChunkedModelClient {
    chunks: Vec<String>,
}

#[async_trait]
impl ModelClient for ChunkedModelClient {
    fn id(&self) -> &str {
        "chunked"
    }

    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _params: &GenerationParams,
    ) -> Result<String, ProviderFailure> {
        Ok(self.chunks.concat())
    }

    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
        _params: GenerationParams,
        _cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderFailure> {
        let mut items: Vec<Result<StreamChunk, ProviderFailure>> = self
            .chunks
            .iter()
            .map(|c| Ok(StreamChunk::TextDelta(c.clone())))
            .collect();
        items.push(Ok(StreamChunk::Done {
            finish_reason: "stop".to_string(),
            usage: None,
        }));
        let stream: Pin<Box<dyn futures::Stream<Item = Result<StreamChunk, ProviderFailure>> + Send>> =
            Box::pin(futures::stream::iter(items));
        Ok(stream)
    }
}

#[tokio::test]
async fn directives_split_across_chunks_invoke_the_tool_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tools = ToolRegistry::new();
    let write_tool = Arc::new(RecordingTool::new("write_file", CapabilityClass::FsWrite));
    tools.register(write_tool.clone()).await;

    let app = AppBuilder::new(
        test_options(dir.path()),
        Arc::new(ChunkedModelClient {
            chunks: vec![
                "writing now [TOO".to_string(),
                "L:write_file:path=a.txt,content=hi] all set".to_string(),
            ],
        }),
    )
    .with_tools(tools)
    .build()
    .await
    .expect("build");

    let output = drain(app.supervisor.execute(
        Request::new("write the greeting file").with_session("ses-split"),
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(write_tool.call_count(), 1);
    let calls = write_tool.calls.lock().expect("calls");
    assert_eq!(calls[0]["path"], "a.txt");
    assert_eq!(calls[0]["content"], "hi");
    drop(calls);

    // The bracketed text was consumed before the surrounding text was yielded.
    assert!(output.contains("writing now "));
    assert!(output.contains("all set"));
    assert!(!output.contains("[TOO"));

    app.shutdown().await.expect("shutdown");
}

/// Model client that records how many calls run concurrently.
struct ConcurrencyProbeClient {
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

#[async_trait]
impl ModelClient for ConcurrencyProbeClient {
    fn id(&self) -> &str {
        "probe"
    }

    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _params: &GenerationParams,
    ) -> Result<String, ProviderFailure> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok("ran".to_string())
    }
}

#[tokio::test]
async fn single_flight_serializes_executions_per_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ConcurrencyProbeClient {
        current: AtomicUsize::new(0),
        max_seen: AtomicUsize::new(0),
    });

    let app = AppBuilder::new(test_options(dir.path()), probe.clone())
        .build()
        .await
        .expect("build");

    let first = app.supervisor.execute(
        Request::new("tidy the changelog").with_session("ses-shared"),
        CancellationToken::new(),
    );
    let second = app.supervisor.execute(
        Request::new("tidy the readme").with_session("ses-shared"),
        CancellationToken::new(),
    );

    let (a, b) = tokio::join!(drain(first), drain(second));
    assert!(a.contains("ran"));
    assert!(b.contains("ran"));
    // Queued, not rejected, and never concurrent for one session.
    assert_eq!(probe.max_seen.load(Ordering::SeqCst), 1);

    app.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn handoffs_append_in_creation_order_across_the_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = AppBuilder::new(
        test_options(dir.path()),
        Arc::new(ScriptedModelClient::always("step done")),
    )
    .build()
    .await
    .expect("build");

    let output = drain(app.supervisor.execute(
        Request::new("Design the architecture for the billing pipeline overhaul")
            .with_session("ses-pipeline"),
        CancellationToken::new(),
    ))
    .await;
    assert!(output.contains("planned 3 task(s)"));

    let handoffs = app.supervisor.handoffs("ses-pipeline");
    assert_eq!(handoffs.len(), 3);
    for pair in handoffs.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }
    // The analyze/implement/review pipeline fans out to distinct specialists.
    assert_eq!(handoffs[0].to_role.as_str(), "architect");
    assert_eq!(handoffs[1].to_role.as_str(), "prometheus");
    assert_eq!(handoffs[2].to_role.as_str(), "reviewer");

    app.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failed_tasks_cancel_their_dependents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = AppBuilder::new(
        test_options(dir.path()),
        Arc::new(ScriptedModelClient::new(vec![Err(
            ProviderFailure::BadRequest("malformed prompt".to_string()),
        )])),
    )
    .build()
    .await
    .expect("build");
    let events = collect_events(&app);

    let output = drain(app.supervisor.execute(
        Request::new("Design the architecture for the billing pipeline overhaul")
            .with_session("ses-abort"),
        CancellationToken::new(),
    ))
    .await;

    assert!(output.contains("bad_request"));

    // Only the first task reached a worker; its dependents were cancelled
    // without failure events of their own.
    let events = events.lock().expect("events");
    assert_eq!(events_of(&events, event_types::TASK_FAILED).len(), 1);
    assert!(events_of(&events, event_types::TASK_COMPLETED).is_empty());
    drop(events);
    assert_eq!(app.supervisor.handoffs("ses-abort").len(), 1);

    app.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_marks_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = AppBuilder::new(
        test_options(dir.path()),
        Arc::new(ScriptedModelClient::always("slow result")),
    )
    .build()
    .await
    .expect("build");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let output = drain(app.supervisor.execute(
        Request::new("tidy the changelog").with_session("ses-cancel"),
        cancel,
    ))
    .await;

    assert!(output.contains("cancelled"));

    app.shutdown().await.expect("shutdown");
}
