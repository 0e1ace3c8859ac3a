use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeOptions;
use crate::directive::{DirectiveScanner, ScanItem};
use crate::event_bus::{EventBus, PersistentEmitter};
use crate::gate::{AutonomyGate, GateOutcome};
use crate::governance::GovernanceBridge;
use crate::planner::{Planner, Router};
use crate::resilience::{BreakerRegistry, ConnectionPool, RetryPolicy};
use crate::session::SessionManager;
use foreman_memory::MemoryStore;
use foreman_observability::{attr, redact_text, MetricsCollector, Span, SpanKind, SpanStatus, Tracer};
use foreman_persistence::Store;
use foreman_providers::{ChatMessage, GenerationParams, ModelClient, StreamChunk};
use foreman_tools::ToolRegistry;
use foreman_types::{
    event_types, AgentRole, AutonomyLevel, ErrorKind, ExecutionResult, Handoff,
    OrchestrationError, PendingOperation, Request, RuntimeEvent, Task, TaskStatus,
};

const HISTORY_CAPACITY: usize = 500;
const PERSISTED_HISTORY: usize = 100;
const SUPERVISOR_STATE_KEY: &str = "supervisor";

/// Result of one worker dispatch inside a task.
struct WorkerOutput {
    text: String,
    tools_used: Vec<String>,
}

/// Everything a finished task hands back to the wave loop.
struct TaskRun {
    task_id: String,
    chunks: Vec<String>,
    outcome: Result<ExecutionResult, OrchestrationError>,
    cancelled: bool,
}

/// Drives request → governance → plan → gate → route → dispatch → snapshot.
/// One instance per process; cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    options: RuntimeOptions,
    planner: Planner,
    router: Router,
    gate: AutonomyGate,
    governance: GovernanceBridge,
    emitter: PersistentEmitter,
    bus: EventBus,
    tracer: Tracer,
    metrics: MetricsCollector,
    retry: RetryPolicy,
    breakers: BreakerRegistry,
    pool: ConnectionPool,
    model: Arc<dyn ModelClient>,
    tools: ToolRegistry,
    memory: Option<Arc<dyn MemoryStore>>,
    sessions: SessionManager,
    store: Arc<Store>,
    session_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    handoff_log: Arc<StdMutex<HashMap<String, Vec<Handoff>>>>,
    history: Arc<StdMutex<VecDeque<ExecutionResult>>>,
    initialized: Arc<AtomicBool>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: RuntimeOptions,
        store: Arc<Store>,
        emitter: PersistentEmitter,
        tracer: Tracer,
        metrics: MetricsCollector,
        gate: AutonomyGate,
        governance: GovernanceBridge,
        model: Arc<dyn ModelClient>,
        tools: ToolRegistry,
        memory: Option<Arc<dyn MemoryStore>>,
        sessions: SessionManager,
    ) -> Self {
        let bus = emitter.bus().clone();
        Self {
            planner: Planner::new(options.max_task_description_len),
            router: Router::new(),
            retry: RetryPolicy::new(options.retry.clone()),
            breakers: BreakerRegistry::new(options.breaker.clone()),
            pool: ConnectionPool::new(options.pool.clone()),
            options,
            gate,
            governance,
            emitter,
            bus,
            tracer,
            metrics,
            model,
            tools,
            memory,
            sessions,
            store,
            session_locks: Arc::new(Mutex::new(HashMap::new())),
            handoff_log: Arc::new(StdMutex::new(HashMap::new())),
            history: Arc::new(StdMutex::new(VecDeque::new())),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn gate(&self) -> &AutonomyGate {
        &self.gate
    }

    /// Handoffs recorded for a session, in creation order.
    pub fn handoffs(&self, session_id: &str) -> Vec<Handoff> {
        self.handoff_log
            .lock()
            .expect("handoff lock")
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn execution_history(&self) -> Vec<ExecutionResult> {
        self.history
            .lock()
            .expect("history lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Requests reconstructable from a recovered snapshot's pending
    /// operations; the caller decides whether to re-submit them.
    pub fn recovered_requests(snapshot: &foreman_types::SessionSnapshot) -> Vec<Request> {
        snapshot
            .pending_operations
            .iter()
            .filter(|op| op.kind == "request")
            .filter_map(|op| {
                let prompt = op.payload.get("prompt")?.as_str()?;
                Some(Request::new(prompt).with_session(snapshot.session_id.clone()))
            })
            .collect()
    }

    /// Execute a request. Chunks stream through the returned receiver; the
    /// channel closing signals completion. Errors surface as marker chunks,
    /// never as panics or a broken stream.
    pub fn execute(&self, request: Request, cancel: CancellationToken) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(64);
        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = supervisor.run_pipeline(request, cancel, &tx).await {
                let _ = tx
                    .send(format!("⚠ {}: {}", err.kind.as_str(), err.detail))
                    .await;
            }
        });
        rx
    }

    async fn ensure_initialized(&self) -> anyhow::Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Boot recovery: re-dispatch outbox rows that never completed
        // delivery, then restore the persisted execution history.
        self.emitter.replay_undelivered(100).await?;
        if let Some(state) = self.store.load_state(SUPERVISOR_STATE_KEY).await? {
            if let Some(entries) = state.get("execution_history").and_then(Value::as_array) {
                let mut history = self.history.lock().expect("history lock");
                for entry in entries {
                    if let Ok(result) = serde_json::from_value::<ExecutionResult>(entry.clone()) {
                        history.push_back(result);
                    }
                }
            }
        }
        Ok(())
    }

    async fn persist_state(&self) -> anyhow::Result<()> {
        let history: Vec<ExecutionResult> = {
            let history = self.history.lock().expect("history lock");
            history
                .iter()
                .rev()
                .take(PERSISTED_HISTORY)
                .rev()
                .cloned()
                .collect()
        };
        self.store
            .save_state(
                SUPERVISOR_STATE_KEY,
                &json!({ "execution_history": history }),
            )
            .await?;
        Ok(())
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run_pipeline(
        &self,
        request: Request,
        cancel: CancellationToken,
        tx: &mpsc::Sender<String>,
    ) -> Result<(), OrchestrationError> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session_{}", uuid::Uuid::new_v4().simple()));

        // Single flight per session: concurrent requests queue here.
        let lock = self.session_lock(&session_id).await;
        let _guard = lock.lock().await;

        let started = Utc::now();
        self.ensure_initialized()
            .await
            .map_err(|err| OrchestrationError::internal(err.to_string()))?;

        let working_directory = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| ".".to_string());
        self.sessions
            .open_or_start(&session_id, &working_directory)
            .await
            .map_err(|err| OrchestrationError::internal(err.to_string()))?;

        let pending_op = PendingOperation::new("request", json!({"prompt": request.prompt}));
        let pending_op_id = pending_op.id.clone();
        self.sessions.add_pending_operation(pending_op).await;
        let _ = self
            .sessions
            .add_message(
                foreman_types::MessageRole::User,
                &request.prompt,
                BTreeMap::new(),
            )
            .await;

        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            session_id = %session_id,
            request_id = %request_id,
            prompt = %redact_text(&request.prompt),
            "request accepted"
        );
        let _ = self
            .emitter
            .emit(
                RuntimeEvent::new(
                    event_types::TASK_RECEIVED,
                    json!({
                        "task_id": request_id,
                        "session_id": session_id,
                        "complexity": self.planner.classify_complexity(&request.prompt).as_str(),
                    }),
                )
                .with_source("supervisor"),
            )
            .await;

        // Governance pre-check: a veto short-circuits the whole session.
        let verdict = self
            .governance
            .review(&request.prompt, json!({"session_id": session_id}))
            .await;
        if !verdict.approved {
            let _ = tx
                .send(format!(
                    "⚠ governance_blocked: veto by {}: {}",
                    verdict.governor, verdict.reasoning
                ))
                .await;
            let _ = self
                .emitter
                .emit(RuntimeEvent::new(
                    event_types::TASK_FAILED,
                    json!({
                        "task_id": request_id,
                        "session_id": session_id,
                        "error_type": ErrorKind::GovernanceBlocked.as_str(),
                        "error": verdict.reasoning,
                    }),
                ))
                .await;
            self.metrics
                .record_error("supervisor", ErrorKind::GovernanceBlocked.as_str());
            self.sessions.remove_pending_operation(&pending_op_id).await;
            let _ = self.sessions.save().await;
            return Ok(());
        }

        let mut tasks = self.planner.plan(&request);
        let _ = tx.send(format!("planned {} task(s)\n", tasks.len())).await;

        let all_succeeded = self
            .run_dag(&session_id, &mut tasks, cancel.clone(), tx)
            .await;

        // Final bookkeeping: history, snapshot, terminal event.
        let elapsed = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        let summary = tasks
            .iter()
            .filter_map(|t| t.result.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let _ = self
            .sessions
            .add_message(
                foreman_types::MessageRole::Assistant,
                &summary,
                BTreeMap::new(),
            )
            .await;
        self.sessions.remove_pending_operation(&pending_op_id).await;
        let _ = self.sessions.save().await;
        let _ = self.persist_state().await;

        if cancel.is_cancelled() {
            let _ = tx.send("cancelled\n".to_string()).await;
            return Ok(());
        }

        if all_succeeded {
            let _ = self
                .emitter
                .emit(RuntimeEvent::new(
                    event_types::TASK_COMPLETED,
                    json!({
                        "task_id": request_id,
                        "session_id": session_id,
                        "tasks": tasks.len(),
                        "elapsed_seconds": elapsed,
                    }),
                ))
                .await;
            let _ = tx.send(format!("done in {elapsed:.1}s\n")).await;
        }
        Ok(())
    }

    /// Execute the task DAG in topological waves with bounded fan-out.
    /// Returns whether every task completed.
    async fn run_dag(
        &self,
        session_id: &str,
        tasks: &mut [Task],
        cancel: CancellationToken,
        tx: &mpsc::Sender<String>,
    ) -> bool {
        let fan_out = self.options.max_parallel_tasks_per_session.max(1);
        let semaphore = Arc::new(Semaphore::new(fan_out));
        let mut completed: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                    task.status = TaskStatus::Cancelled;
                    self.gate.mark_task_cancelled(&task.id).await;
                }
                return false;
            }

            let wave: Vec<usize> = tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| {
                    t.status == TaskStatus::Pending
                        && t.dependencies.iter().all(|d| completed.contains(d))
                })
                .map(|(idx, _)| idx)
                .collect();

            if wave.is_empty() {
                // Cancel tasks whose dependency chain can no longer finish.
                let mut any_cancelled = false;
                for task in tasks.iter_mut().filter(|t| t.status == TaskStatus::Pending) {
                    if task.dependencies.iter().any(|d| blocked.contains(d)) {
                        task.status = TaskStatus::Cancelled;
                        blocked.insert(task.id.clone());
                        self.gate.mark_task_cancelled(&task.id).await;
                        any_cancelled = true;
                    }
                }
                if any_cancelled {
                    continue;
                }
                break;
            }

            let mut join = tokio::task::JoinSet::new();
            for idx in &wave {
                let task_idx = *idx;
                tasks[task_idx].status = TaskStatus::Ready;
                let task = tasks[task_idx].clone();
                let supervisor = self.clone();
                let session = session_id.to_string();
                let permit_source = semaphore.clone();
                let task_cancel = cancel.clone();
                join.spawn(async move {
                    let _permit = permit_source.acquire_owned().await.ok();
                    let run = supervisor.run_task(&session, task, task_cancel).await;
                    (task_idx, run)
                });
                tasks[task_idx].status = TaskStatus::InProgress;
            }

            let mut runs: HashMap<usize, TaskRun> = HashMap::new();
            while let Some(joined) = join.join_next().await {
                if let Ok((idx, run)) = joined {
                    runs.insert(idx, run);
                }
            }

            // Yield outputs deterministically in wave order.
            for idx in wave {
                let Some(run) = runs.remove(&idx) else {
                    tasks[idx].status = TaskStatus::Failed;
                    blocked.insert(tasks[idx].id.clone());
                    continue;
                };
                for chunk in &run.chunks {
                    let _ = tx.send(chunk.clone()).await;
                }
                match run.outcome {
                    Ok(result) => {
                        tasks[idx].status = TaskStatus::Completed;
                        tasks[idx].result = Some(result.output.clone());
                        completed.insert(run.task_id.clone());
                        self.record_result(result).await;
                    }
                    Err(err) => {
                        tasks[idx].status = if run.cancelled {
                            TaskStatus::Cancelled
                        } else {
                            TaskStatus::Failed
                        };
                        blocked.insert(run.task_id.clone());
                        let _ = tx
                            .send(format!("⚠ {}: {}\n", err.kind.as_str(), err.detail))
                            .await;
                        let _ = self
                            .emitter
                            .emit(RuntimeEvent::new(
                                event_types::TASK_FAILED,
                                json!({
                                    "task_id": run.task_id,
                                    "session_id": session_id,
                                    "error_type": err.kind.as_str(),
                                    "error": err.detail,
                                }),
                            ))
                            .await;
                        self.metrics.record_error("supervisor", err.kind.as_str());
                    }
                }
            }
        }

        tasks
            .iter()
            .all(|t| t.status == TaskStatus::Completed)
    }

    async fn record_result(&self, result: ExecutionResult) {
        {
            let mut history = self.history.lock().expect("history lock");
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        let _ = self
            .emitter
            .emit(RuntimeEvent::new(
                event_types::TASK_STEP,
                json!({
                    "task_id": result.task_id,
                    "success": result.success,
                    "tools_used": result.tools_used,
                    "elapsed_seconds": result.elapsed_seconds,
                }),
            ))
            .await;

        if let Some(memory) = &self.memory {
            let outcome = if result.success { "succeeded" } else { "failed" };
            let _ = memory
                .remember(
                    &result.output.chars().take(200).collect::<String>(),
                    outcome,
                    json!({"task_id": result.task_id}),
                    result.score,
                )
                .await;
        }
    }

    /// Gate, route, record the handoff, and dispatch one task through the
    /// resilience stack.
    async fn run_task(&self, session_id: &str, mut task: Task, cancel: CancellationToken) -> TaskRun {
        let task_id = task.id.clone();
        let started = Utc::now();
        let mut chunks = Vec::new();

        // Autonomy gate.
        let gate_outcome = self.gate.evaluate(&task, cancel.clone()).await;
        let granted_level = match &gate_outcome {
            GateOutcome::Proceed { level, .. } => *level,
            GateOutcome::Approved(request) => request.autonomy_level,
            GateOutcome::Denied { kind, .. } => {
                return TaskRun {
                    task_id,
                    chunks,
                    outcome: Err(OrchestrationError::new(
                        *kind,
                        format!("task blocked at the autonomy gate: {}", task.description),
                    )),
                    cancelled: false,
                };
            }
        };

        // Routing is pure; record the assignment on the task.
        let role = self.router.route(&task);
        task.assigned_role = Some(role);
        let model_id = self.router.model_for_complexity(task.complexity).to_string();

        let mut span = self
            .tracer
            .start_trace(SpanKind::Agent, &format!("agent.{role}"));
        span.set_baggage("session_id", session_id);
        span.set_attribute(attr::AGENT_ID, json!(role.as_str()));
        span.set_attribute(attr::AGENT_NAME, json!(format!("{role} worker")));
        span.set_attribute(attr::OPERATION_NAME, json!("invoke_agent"));
        span.set_attribute(attr::REQUEST_MODEL, json!(model_id));
        span.add_event(
            "autonomy_granted",
            BTreeMap::from([(
                "autonomy_level".to_string(),
                json!(granted_level.as_str()),
            )]),
        );

        // Handoff record, strict append order per session.
        let handoff = Handoff::new(AgentRole::Orchestrator, role, &task, session_id);
        self.handoff_log
            .lock()
            .expect("handoff lock")
            .entry(session_id.to_string())
            .or_default()
            .push(handoff);
        chunks.push(format!("[{role}] {}\n", task.description));

        // Provider-side throttle hint, consulted before dispatch.
        let (throttle, delay_seconds) = self.model.should_throttle();
        if throttle {
            let delay = Duration::from_secs_f64(delay_seconds.clamp(0.0, 30.0));
            tracing::info!(delay_seconds, "throttling before dispatch");
            tokio::time::sleep(delay).await;
        }

        let breaker = self
            .breakers
            .breaker_for("model", &format!("{role}/{model_id}"));
        let messages = vec![
            ChatMessage::system(format!(
                "You are the {role} specialist. Complete the task and report the result."
            )),
            ChatMessage::user(task.description.clone()),
        ];
        let params = GenerationParams {
            model: model_id.clone(),
            max_tokens: if task.estimated_tokens > 0 {
                task.estimated_tokens.min(u32::MAX as u64) as u32
            } else {
                1024
            },
            temperature: 0.7,
        };

        // Cooperative cancellation with a grace period for the in-flight call.
        let grace = Duration::from_secs_f64(self.options.cancellation_grace_seconds.max(0.0));
        let (outcome, cancelled) = {
            let worker = self.retry.run(|_attempt| {
                let messages = messages.clone();
                let params = params.clone();
                let breaker = breaker.clone();
                let span_ref = &span;
                let cancel = cancel.clone();
                async move {
                    breaker.try_acquire()?;
                    let _conn = self.pool.acquire().await?;
                    match self
                        .dispatch_worker(span_ref, granted_level, messages, params, cancel)
                        .await
                    {
                        Ok(output) => {
                            breaker.record_success();
                            Ok(output)
                        }
                        Err(err) => {
                            if err.kind != ErrorKind::CircuitOpen {
                                breaker.record_failure();
                            }
                            Err(err)
                        }
                    }
                }
            });
            tokio::pin!(worker);
            let raced = tokio::select! {
                result = &mut worker => Some(result),
                _ = cancel.cancelled() => None,
            };
            match raced {
                Some(result) => (result, false),
                None => {
                    // The worker saw the token; give it the grace period,
                    // then discard whatever it produced.
                    let _ = tokio::time::timeout(grace, &mut worker).await;
                    (
                        Err(OrchestrationError::new(
                            ErrorKind::Timeout,
                            "task cancelled by caller",
                        )),
                        true,
                    )
                }
            }
        };

        let elapsed = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        self.metrics.record_latency(
            "invoke_agent",
            &model_id,
            (Utc::now() - started).num_milliseconds() as f64,
        );

        match outcome {
            Ok(output) => {
                self.tracer.finish(span, SpanStatus::Ok);
                if !output.text.is_empty() {
                    chunks.push(output.text.clone());
                }
                TaskRun {
                    task_id: task_id.clone(),
                    chunks,
                    outcome: Ok(ExecutionResult {
                        task_id,
                        output: output.text,
                        success: true,
                        score: 1.0,
                        tools_used: output.tools_used,
                        elapsed_seconds: elapsed,
                    }),
                    cancelled: false,
                }
            }
            Err(err) => {
                self.tracer.finish_with_error(span, err.to_string());
                TaskRun {
                    task_id,
                    chunks,
                    outcome: Err(err),
                    cancelled,
                }
            }
        }
    }

    /// One attempt against the model: stream the completion under the worker
    /// deadline, extracting inline tool directives as they close.
    async fn dispatch_worker(
        &self,
        parent: &Span,
        granted_level: AutonomyLevel,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput, OrchestrationError> {
        let model_id = params.model.clone();
        let mut llm_span = self.tracer.start_child(parent, SpanKind::Llm, "generate");
        llm_span.set_attribute(attr::OPERATION_NAME, json!("chat"));
        llm_span.set_attribute(attr::REQUEST_MODEL, json!(model_id));

        let deadline = Duration::from_secs_f64(self.options.worker_deadline_seconds.max(0.1));
        let llm_started = Utc::now();

        let stream = match self
            .model
            .stream(messages, params, cancel.child_token())
            .await
        {
            Ok(stream) => stream,
            Err(failure) => {
                self.tracer.finish_with_error(llm_span, failure.to_string());
                return Err(OrchestrationError::new(failure.kind(), failure.to_string()));
            }
        };

        let consume = async {
            let mut stream = stream;
            let mut scanner = DirectiveScanner::new();
            let mut text = String::new();
            let mut tools_used = Vec::new();
            let mut first_token_at = None;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(StreamChunk::TextDelta(delta)) => {
                        if first_token_at.is_none() {
                            first_token_at = Some(Utc::now());
                        }
                        for scanned in scanner.push(&delta) {
                            match scanned {
                                ScanItem::Text(run) => text.push_str(&run),
                                ScanItem::Directive(directive) => {
                                    self.invoke_directive(
                                        parent,
                                        granted_level,
                                        &directive.name,
                                        directive.args_json(),
                                        &mut text,
                                        &mut tools_used,
                                    )
                                    .await;
                                }
                            }
                        }
                    }
                    Ok(StreamChunk::Done { usage, .. }) => {
                        if let Some(usage) = usage {
                            self.metrics.record_token_usage(
                                "chat",
                                &model_id,
                                usage.input_tokens,
                                usage.output_tokens,
                            );
                        }
                    }
                    Err(failure) => {
                        return Err(OrchestrationError::new(
                            failure.kind(),
                            failure.to_string(),
                        ));
                    }
                }
            }
            if let Some(rest) = scanner.finish() {
                text.push_str(&rest);
            }
            if let Some(first) = first_token_at {
                self.metrics.record_ttft(
                    &model_id,
                    (first - llm_started).num_milliseconds() as f64,
                );
            }
            Ok(WorkerOutput { text, tools_used })
        };

        match tokio::time::timeout(deadline, consume).await {
            Ok(Ok(output)) => {
                self.tracer.finish(llm_span, SpanStatus::Ok);
                Ok(output)
            }
            Ok(Err(err)) => {
                self.tracer.finish_with_error(llm_span, err.to_string());
                Err(err)
            }
            Err(_) => {
                self.tracer
                    .finish_with_error(llm_span, "worker deadline exceeded");
                Err(OrchestrationError::new(
                    ErrorKind::Timeout,
                    "worker deadline exceeded",
                ))
            }
        }
    }

    /// Dispatch one inline directive, enforcing the capability class
    /// against the task's granted autonomy level.
    async fn invoke_directive(
        &self,
        parent: &Span,
        granted_level: AutonomyLevel,
        name: &str,
        args: Value,
        text: &mut String,
        tools_used: &mut Vec<String>,
    ) {
        if let Some(tool) = self.tools.get(name).await {
            let required = tool.spec().capability.required_level();
            if required > granted_level {
                tracing::warn!(
                    tool = name,
                    required = required.as_str(),
                    granted = granted_level.as_str(),
                    "tool blocked by autonomy level"
                );
                self.metrics.record_error("supervisor", "tool_blocked");
                text.push_str(&format!("⚠ tool `{name}` requires {}\n", required.as_str()));
                return;
            }
        }

        let mut tool_span = self
            .tracer
            .start_child(parent, SpanKind::Tool, &format!("tool.{name}"));
        tool_span.set_attribute(attr::TOOL_NAME, json!(name));

        match self.tools.invoke(name, args).await {
            Ok(result) => {
                let unknown = result
                    .metadata
                    .get("unknown_tool")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if unknown {
                    text.push_str(&format!("{}\n", result.output));
                    self.metrics.record_tool_invocation(name, false);
                    self.tracer
                        .finish_with_error(tool_span, "unknown tool");
                } else {
                    tools_used.push(name.to_string());
                    self.metrics.record_tool_invocation(name, true);
                    self.tracer.finish(tool_span, SpanStatus::Ok);
                }
            }
            Err(err) => {
                self.metrics.record_tool_invocation(name, false);
                self.tracer.finish_with_error(tool_span, err.to_string());
                text.push_str(&format!("⚠ tool `{name}` failed: {err}\n"));
            }
        }
    }
}
