use uuid::Uuid;

use foreman_types::{AgentRole, Request, Task, TaskComplexity};

/// Keyword routing table. First match over the lowercased description wins.
const ROUTING_TABLE: &[(&str, AgentRole)] = &[
    ("code", AgentRole::Coder),
    ("review", AgentRole::Reviewer),
    ("architecture", AgentRole::Architect),
    ("research", AgentRole::Researcher),
    ("deploy", AgentRole::Devops),
    ("test", AgentRole::Coder),
    ("refactor", AgentRole::Coder),
    ("security", AgentRole::Reviewer),
    ("documentation", AgentRole::Researcher),
    ("plan", AgentRole::Prometheus),
    ("complex", AgentRole::Prometheus),
    ("evolve", AgentRole::Prometheus),
    ("simulate", AgentRole::Prometheus),
];

/// Decomposes a request into an ordered, dependency-consistent task list.
/// Planning never fails; pathological input collapses to a singleton task.
#[derive(Debug, Clone)]
pub struct Planner {
    max_description_len: usize,
}

impl Planner {
    pub fn new(max_description_len: usize) -> Self {
        Self {
            max_description_len: max_description_len.max(1),
        }
    }

    /// Deterministic complexity surface. Risk keywords outrank length so a
    /// four-word production request still classifies critical.
    pub fn classify_complexity(&self, request: &str) -> TaskComplexity {
        let lowered = request.to_lowercase();
        let word_count = lowered.split_whitespace().count();

        if word_count == 0 {
            return TaskComplexity::Trivial;
        }
        if lowered.contains("production") || lowered.contains("security") {
            return TaskComplexity::Critical;
        }
        if lowered.contains("architecture") || lowered.contains("design") {
            return TaskComplexity::Complex;
        }
        if word_count < 6 {
            return TaskComplexity::Trivial;
        }
        if word_count < 10 {
            return TaskComplexity::Simple;
        }
        TaskComplexity::Moderate
    }

    /// Produce the task DAG for a request. The returned list is
    /// topologically sorted: every dependency id refers to an earlier task.
    pub fn plan(&self, request: &Request) -> Vec<Task> {
        let mut description = request.prompt.trim().to_string();
        if description.is_empty() {
            description = "(empty request)".to_string();
        }
        if description.len() > self.max_description_len {
            description.truncate(self.max_description_len);
        }

        let complexity = self.classify_complexity(&description);

        // Complex work expands into a bounded analyze/implement/review
        // pipeline; everything else stays a single accountable unit.
        if complexity == TaskComplexity::Complex {
            let analyze = Task::new(
                Uuid::new_v4().to_string(),
                format!("Analyze requirements: {description}"),
            )
            .with_complexity(TaskComplexity::Moderate);
            let implement = Task::new(
                Uuid::new_v4().to_string(),
                format!("Implement: {description}"),
            )
            .with_complexity(complexity)
            .with_dependency(analyze.id.clone());
            let review = Task::new(
                Uuid::new_v4().to_string(),
                format!("Review the implementation: {description}"),
            )
            .with_complexity(TaskComplexity::Moderate)
            .with_dependency(implement.id.clone());
            return vec![analyze, implement, review];
        }

        vec![Task::new(Uuid::new_v4().to_string(), description).with_complexity(complexity)]
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Pure task-to-role routing: same input, same output.
#[derive(Debug, Clone, Default)]
pub struct Router;

impl Router {
    pub fn new() -> Self {
        Self
    }

    pub fn route(&self, task: &Task) -> AgentRole {
        // Complexity elevation outranks keyword routing.
        if matches!(
            task.complexity,
            TaskComplexity::Complex | TaskComplexity::Critical
        ) {
            return AgentRole::Prometheus;
        }

        let lowered = task.description.to_lowercase();
        for (keyword, role) in ROUTING_TABLE {
            if lowered.contains(keyword) {
                return *role;
            }
        }
        AgentRole::Coder
    }

    pub fn route_many<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a Task>,
    ) -> Vec<(String, AgentRole)> {
        tasks
            .into_iter()
            .map(|task| (task.id.clone(), self.route(task)))
            .collect()
    }

    /// Unique set of roles a plan needs, in routing order.
    pub fn roles_for<'a>(&self, tasks: impl IntoIterator<Item = &'a Task>) -> Vec<AgentRole> {
        let mut roles = Vec::new();
        for task in tasks {
            let role = self.route(task);
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        roles
    }

    /// Model tier recommendation per complexity.
    pub fn model_for_complexity(&self, complexity: TaskComplexity) -> &'static str {
        match complexity {
            TaskComplexity::Trivial | TaskComplexity::Simple => "fast-mini",
            TaskComplexity::Moderate => "balanced-1",
            TaskComplexity::Complex | TaskComplexity::Critical => "frontier-1",
        }
    }
}
