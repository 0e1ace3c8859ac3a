use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::ApprovalOptions;
use crate::event_bus::EventBus;
use foreman_types::{
    event_types, ApprovalDecision, ApprovalRequest, AutonomyLevel, ErrorKind, OperationClass,
    RuntimeEvent, Task, TaskComplexity,
};

/// Non-blocking notice delivered for L1 operations.
#[derive(Debug, Clone)]
pub struct GateNotice {
    pub task_id: String,
    pub operation_class: OperationClass,
    pub autonomy_level: AutonomyLevel,
    pub description: String,
}

pub type NotifyFn = Arc<dyn Fn(GateNotice) + Send + Sync>;
pub type ApprovalFn =
    Arc<dyn Fn(ApprovalRequest) -> BoxFuture<'static, ApprovalDecision> + Send + Sync>;

/// Outcome of gating one task.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// L0/L1: execution may start immediately.
    Proceed {
        level: AutonomyLevel,
        class: OperationClass,
    },
    /// L2/L3 request granted.
    Approved(ApprovalRequest),
    /// Blocked. `kind` is one of `approval_rejected`, `approval_timed_out`,
    /// `governance_blocked`.
    Denied {
        request: Option<ApprovalRequest>,
        kind: ErrorKind,
    },
}

impl GateOutcome {
    pub fn may_proceed(&self) -> bool {
        matches!(self, GateOutcome::Proceed { .. } | GateOutcome::Approved(_))
    }
}

/// Classify a task description into an operation class. Most dangerous
/// match wins.
pub fn classify_operation(description: &str) -> OperationClass {
    let lowered = description.to_lowercase();
    let has = |needle: &str| lowered.contains(needle);

    if has("rotate") && (has("secret") || has("credential") || has("key")) {
        return OperationClass::RotateSecrets;
    }
    if (has("delete") || has("drop") || has("truncate") || has("wipe"))
        && (has("data") || has("database") || has("table"))
    {
        return OperationClass::DeleteData;
    }
    if has("security") && (has("modify") || has("change") || has("update") || has("disable")) {
        return OperationClass::ModifySecurity;
    }
    if has("deploy") {
        if has("production") || has("prod ") || lowered.ends_with("prod") {
            return OperationClass::DeployProduction;
        }
        return OperationClass::DeployStaging;
    }
    if has("commit") || has("push") {
        return OperationClass::CommitChanges;
    }
    if has("install") || has("dependency") || has("upgrade") {
        return OperationClass::InstallDependency;
    }
    if has("refactor") {
        return OperationClass::Refactor;
    }
    if has("write") || has("create file") || has("save") {
        return OperationClass::WriteFile;
    }
    if has("test") {
        return OperationClass::RunTests;
    }
    if has("read") || has("list") || has("show") || has("view") {
        return OperationClass::ReadFile;
    }
    OperationClass::General
}

/// Bounded-autonomy gate. Owns every approval record; the supervisor holds
/// only ids.
#[derive(Clone)]
pub struct AutonomyGate {
    options: ApprovalOptions,
    requests: Arc<RwLock<HashMap<String, ApprovalRequest>>>,
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<ApprovalDecision>>>>>,
    cancelled_tasks: Arc<RwLock<HashSet<String>>>,
    notify: Option<NotifyFn>,
    approver: Option<ApprovalFn>,
    bus: EventBus,
}

impl AutonomyGate {
    pub fn new(options: ApprovalOptions, bus: EventBus) -> Self {
        Self {
            options,
            requests: Arc::new(RwLock::new(HashMap::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
            cancelled_tasks: Arc::new(RwLock::new(HashSet::new())),
            notify: None,
            approver: None,
            bus,
        }
    }

    pub fn with_notify(mut self, notify: NotifyFn) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn with_approver(mut self, approver: ApprovalFn) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Effective autonomy level for a task: the static class level,
    /// escalated to at least L2 for critical-complexity work.
    pub fn effective_level(&self, task: &Task) -> (OperationClass, AutonomyLevel) {
        let class = classify_operation(&task.description);
        let mut level = class.autonomy_level();
        if task.complexity == TaskComplexity::Critical && level < AutonomyLevel::L2Approve {
            level = AutonomyLevel::L2Approve;
        }
        (class, level)
    }

    /// Gate a task. L0 proceeds silently, L1 proceeds and notifies without
    /// blocking, L2 blocks on approval or timeout, L3 requires a configured
    /// approver and an explicit grant.
    pub async fn evaluate(&self, task: &Task, cancel: CancellationToken) -> GateOutcome {
        let (class, level) = self.effective_level(task);

        match level {
            AutonomyLevel::L0Autonomous => GateOutcome::Proceed { level, class },
            AutonomyLevel::L1Notify => {
                if let Some(notify) = self.notify.clone() {
                    let notice = GateNotice {
                        task_id: task.id.clone(),
                        operation_class: class,
                        autonomy_level: level,
                        description: task.description.clone(),
                    };
                    tokio::spawn(async move {
                        notify(notice);
                    });
                }
                GateOutcome::Proceed { level, class }
            }
            AutonomyLevel::L2Approve | AutonomyLevel::L3HumanOnly => {
                if level == AutonomyLevel::L3HumanOnly && self.approver.is_none() {
                    tracing::warn!(task_id = %task.id, "human-only operation with no approver");
                    return GateOutcome::Denied {
                        request: None,
                        kind: ErrorKind::GovernanceBlocked,
                    };
                }
                self.await_approval(task, class, level, cancel).await
            }
        }
    }

    /// Contract form of [`AutonomyGate::evaluate`]: `(may_proceed, approval)`.
    pub async fn check(&self, task: &Task) -> (bool, Option<ApprovalRequest>) {
        match self.evaluate(task, CancellationToken::new()).await {
            GateOutcome::Proceed { .. } => (true, None),
            GateOutcome::Approved(request) => (true, Some(request)),
            GateOutcome::Denied { request, .. } => (false, request),
        }
    }

    async fn await_approval(
        &self,
        task: &Task,
        class: OperationClass,
        level: AutonomyLevel,
        cancel: CancellationToken,
    ) -> GateOutcome {
        let request = ApprovalRequest::for_task(task, class, level);
        let request_id = request.id.clone();

        let (tx, mut rx) = watch::channel(None);
        self.requests
            .write()
            .await
            .insert(request_id.clone(), request.clone());
        self.waiters.write().await.insert(request_id.clone(), tx);

        self.bus.dispatch(&RuntimeEvent::new(
            event_types::APPROVAL_ASKED,
            json!({
                "request_id": request_id,
                "task_id": task.id,
                "operation_class": class.as_str(),
                "autonomy_level": level.as_str(),
            }),
        ));

        if let Some(approver) = self.approver.clone() {
            let gate = self.clone();
            let pending = request.clone();
            let id = request_id.clone();
            tokio::spawn(async move {
                let decision = approver(pending).await;
                gate.resolve(&id, decision, Some("approval_callback".to_string()))
                    .await;
            });
        }

        let timeout = Duration::from_secs_f64(self.options.default_timeout_seconds.max(0.0));
        let decision = tokio::select! {
            _ = cancel.cancelled() => ApprovalDecision::Rejected,
            outcome = tokio::time::timeout(timeout, async {
                loop {
                    if rx.changed().await.is_err() {
                        return ApprovalDecision::TimedOut;
                    }
                    if let Some(decision) = *rx.borrow() {
                        return decision;
                    }
                }
            }) => outcome.unwrap_or(ApprovalDecision::TimedOut),
        };

        self.waiters.write().await.remove(&request_id);
        let settled = {
            let mut requests = self.requests.write().await;
            let entry = requests.get_mut(&request_id);
            if let Some(entry) = entry {
                if !entry.decision.is_settled() {
                    entry.settle(decision, None);
                }
                entry.clone()
            } else {
                request
            }
        };

        self.bus.dispatch(&RuntimeEvent::new(
            event_types::APPROVAL_REPLIED,
            json!({
                "request_id": request_id,
                "decision": settled.decision,
            }),
        ));

        match settled.decision {
            ApprovalDecision::Approved => GateOutcome::Approved(settled),
            ApprovalDecision::Rejected | ApprovalDecision::Pending => GateOutcome::Denied {
                request: Some(settled),
                kind: ErrorKind::ApprovalRejected,
            },
            ApprovalDecision::TimedOut => GateOutcome::Denied {
                request: Some(settled),
                kind: ErrorKind::ApprovalTimedOut,
            },
        }
    }

    /// Settle a pending approval from outside (human UI, callback, test).
    /// Grants for tasks that were cancelled in the meantime are discarded.
    pub async fn resolve(
        &self,
        request_id: &str,
        decision: ApprovalDecision,
        decider: Option<String>,
    ) -> bool {
        let task_id = {
            let requests = self.requests.read().await;
            let Some(request) = requests.get(request_id) else {
                return false;
            };
            request.task_id.clone()
        };

        if decision == ApprovalDecision::Approved
            && self.cancelled_tasks.read().await.contains(&task_id)
        {
            tracing::info!(request_id, task_id = %task_id, "discarding grant for cancelled task");
            return false;
        }

        {
            let mut requests = self.requests.write().await;
            if let Some(request) = requests.get_mut(request_id) {
                if request.decision.is_settled() {
                    return false;
                }
                request.settle(decision, decider);
            }
        }

        if let Some(waiter) = self.waiters.read().await.get(request_id).cloned() {
            let _ = waiter.send(Some(decision));
        }
        true
    }

    pub async fn mark_task_cancelled(&self, task_id: &str) {
        self.cancelled_tasks
            .write()
            .await
            .insert(task_id.to_string());
    }

    pub async fn list_requests(&self) -> Vec<ApprovalRequest> {
        self.requests.read().await.values().cloned().collect()
    }

    pub async fn get_request(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.requests.read().await.get(request_id).cloned()
    }
}
