use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw user request entering the supervisor. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Request {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Task complexity tiers used for routing and autonomy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Critical,
}

impl TaskComplexity {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskComplexity::Trivial => "trivial",
            TaskComplexity::Simple => "simple",
            TaskComplexity::Moderate => "moderate",
            TaskComplexity::Complex => "complex",
            TaskComplexity::Critical => "critical",
        }
    }
}

/// Worker roles a task can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Coder,
    Reviewer,
    Architect,
    Researcher,
    Devops,
    Prometheus,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Coder => "coder",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Architect => "architect",
            AgentRole::Researcher => "researcher",
            AgentRole::Devops => "devops",
            AgentRole::Prometheus => "prometheus",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Unit of work produced by the planner and owned by the supervisor while it
/// executes. Dependencies must refer to tasks that appear earlier in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub complexity: TaskComplexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_role: Option<AgentRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub estimated_tokens: u64,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            complexity: TaskComplexity::Moderate,
            assigned_role: None,
            parent_task_id: None,
            dependencies: BTreeSet::new(),
            status: TaskStatus::Pending,
            result: None,
            estimated_tokens: 0,
        }
    }

    pub fn with_complexity(mut self, complexity: TaskComplexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }
}

/// Immutable record of a role-to-role transfer. Kept in strict append order
/// per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub from_role: AgentRole,
    pub to_role: AgentRole,
    pub task_id: String,
    pub context: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Handoff {
    pub fn new(
        from_role: AgentRole,
        to_role: AgentRole,
        task: &Task,
        context: impl Into<String>,
    ) -> Self {
        let mut summary = task.description.clone();
        if summary.len() > 50 {
            summary.truncate(50);
            summary.push_str("...");
        }
        Self {
            from_role,
            to_role,
            task_id: task.id.clone(),
            context: context.into(),
            reason: format!("Routing {summary}"),
            created_at: Utc::now(),
        }
    }
}

/// Terminal outcome of one task, produced by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub output: String,
    pub success: bool,
    pub score: f64,
    #[serde(default)]
    pub tools_used: Vec<String>,
    pub elapsed_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_reason_truncates_long_descriptions() {
        let task = Task::new("t-1", "x".repeat(120));
        let handoff = Handoff::new(AgentRole::Orchestrator, AgentRole::Coder, &task, "ctx");
        assert!(handoff.reason.starts_with("Routing "));
        assert!(handoff.reason.ends_with("..."));
        assert!(handoff.reason.len() < 70);
    }

    #[test]
    fn complexity_orders_from_trivial_to_critical() {
        assert!(TaskComplexity::Trivial < TaskComplexity::Simple);
        assert!(TaskComplexity::Complex < TaskComplexity::Critical);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
    }
}
