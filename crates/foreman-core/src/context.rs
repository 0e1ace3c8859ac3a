use std::sync::Arc;

use crate::config::RuntimeOptions;
use crate::event_bus::{EventBus, PersistentEmitter};
use crate::gate::{ApprovalFn, AutonomyGate, NotifyFn};
use crate::governance::{GovernanceBridge, GovernanceReviewer};
use crate::session::{SessionManager, SessionManagerOptions};
use crate::supervisor::Supervisor;
use foreman_memory::{MemoryStore, SqliteMemoryStore};
use foreman_observability::{MetricsCollector, Tracer};
use foreman_persistence::Store;
use foreman_providers::ModelClient;
use foreman_tools::ToolRegistry;

/// Process-wide wiring. Components are constructed once here and injected
/// into each other; nothing reaches for a global.
pub struct AppContext {
    pub options: RuntimeOptions,
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub emitter: PersistentEmitter,
    pub tracer: Tracer,
    pub metrics: MetricsCollector,
    pub gate: AutonomyGate,
    pub governance: GovernanceBridge,
    pub sessions: SessionManager,
    pub memory: Arc<dyn MemoryStore>,
    pub tools: ToolRegistry,
    pub supervisor: Supervisor,
}

/// Assembles an [`AppContext`]. The model client is the only mandatory
/// collaborator; everything else has a working default.
pub struct AppBuilder {
    options: RuntimeOptions,
    model: Arc<dyn ModelClient>,
    reviewer: Option<Arc<dyn GovernanceReviewer>>,
    approver: Option<ApprovalFn>,
    notify: Option<NotifyFn>,
    tools: ToolRegistry,
}

impl AppBuilder {
    pub fn new(options: RuntimeOptions, model: Arc<dyn ModelClient>) -> Self {
        Self {
            options,
            model,
            reviewer: None,
            approver: None,
            notify: None,
            tools: ToolRegistry::new(),
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn GovernanceReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn with_approver(mut self, approver: ApprovalFn) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_notify(mut self, notify: NotifyFn) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub async fn build(self) -> anyhow::Result<AppContext> {
        let store = Arc::new(Store::open(&self.options.persistence_path).await?);
        let bus = EventBus::new();
        let emitter = PersistentEmitter::new(store.clone(), bus.clone());
        let tracer = Tracer::new(self.options.tracer.clone());
        let metrics = MetricsCollector::new();

        let mut gate = AutonomyGate::new(self.options.approval.clone(), bus.clone());
        if let Some(notify) = self.notify {
            gate = gate.with_notify(notify);
        }
        if let Some(approver) = self.approver {
            gate = gate.with_approver(approver);
        }

        let mut governance = GovernanceBridge::new(self.options.governance.clone());
        if let Some(reviewer) = self.reviewer {
            governance = governance.with_reviewer(reviewer);
        }

        let sessions = SessionManager::new(
            &self.options.session_dir,
            SessionManagerOptions {
                auto_save_interval_seconds: self.options.auto_save_interval_seconds,
                compression_threshold_bytes: self.options.compression_threshold_bytes,
                max_sessions: self.options.max_sessions,
            },
        )?;

        let memory: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::new(store.clone()));

        let supervisor = Supervisor::new(
            self.options.clone(),
            store.clone(),
            emitter.clone(),
            tracer.clone(),
            metrics.clone(),
            gate.clone(),
            governance.clone(),
            self.model,
            self.tools.clone(),
            Some(memory.clone()),
            sessions.clone(),
        );

        Ok(AppContext {
            options: self.options,
            store,
            bus,
            emitter,
            tracer,
            metrics,
            gate,
            governance,
            sessions,
            memory,
            tools: self.tools,
            supervisor,
        })
    }
}

impl AppContext {
    /// Graceful shutdown: stop the auto-save loop, flush the live session,
    /// and purge old delivered outbox rows.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.sessions.end_session().await?;
        self.emitter
            .cleanup_delivered(chrono::Duration::hours(24))
            .await?;
        tracing::info!("runtime shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_providers::ScriptedModelClient;
    use foreman_types::Request;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn builder_wires_a_working_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = RuntimeOptions {
            persistence_path: dir.path().join("runtime.db"),
            session_dir: dir.path().join("sessions"),
            ..RuntimeOptions::default()
        };
        let app = AppBuilder::new(
            options,
            Arc::new(ScriptedModelClient::always("wired up")),
        )
        .build()
        .await
        .expect("build");

        let mut rx = app
            .supervisor
            .execute(Request::new("say hello"), CancellationToken::new());
        let mut output = String::new();
        while let Some(chunk) = rx.recv().await {
            output.push_str(&chunk);
        }
        assert!(output.contains("wired up"));

        app.shutdown().await.expect("shutdown");
    }
}
