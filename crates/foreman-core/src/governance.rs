use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::GovernanceOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    pub reasoning: String,
    pub risk_level: String,
    pub governor: String,
}

impl Verdict {
    pub fn permissive(governor: &str, reasoning: &str) -> Self {
        Self {
            approved: true,
            reasoning: reasoning.to_string(),
            risk_level: "unknown".to_string(),
            governor: governor.to_string(),
        }
    }

    pub fn veto(governor: &str, reasoning: &str) -> Self {
        Self {
            approved: false,
            reasoning: reasoning.to_string(),
            risk_level: "high".to_string(),
            governor: governor.to_string(),
        }
    }
}

/// Policy reviewer consulted before planning. The judging sub-system behind
/// it is an external collaborator.
#[async_trait]
pub trait GovernanceReviewer: Send + Sync {
    async fn review(&self, task: &str, context: &Value) -> anyhow::Result<Verdict>;
}

/// Wraps the reviewer with a hard deadline. A missing, slow, or failing
/// reviewer yields a permissive verdict with a warning rather than
/// blocking the session.
#[derive(Clone)]
pub struct GovernanceBridge {
    options: GovernanceOptions,
    reviewer: Option<Arc<dyn GovernanceReviewer>>,
}

impl GovernanceBridge {
    pub fn new(options: GovernanceOptions) -> Self {
        Self {
            options,
            reviewer: None,
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn GovernanceReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub async fn review(&self, task: &str, context: Value) -> Verdict {
        let Some(reviewer) = self.reviewer.clone() else {
            return Verdict::permissive("none", "no governance reviewer configured");
        };

        let timeout = Duration::from_secs_f64(self.options.review_timeout_seconds.max(0.0));
        match tokio::time::timeout(timeout, reviewer.review(task, &context)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "governance review failed, proceeding permissively");
                Verdict::permissive("review_error", &format!("review failed: {err}"))
            }
            Err(_) => {
                tracing::warn!(
                    timeout_seconds = self.options.review_timeout_seconds,
                    "governance review timed out, proceeding permissively"
                );
                Verdict::permissive("review_timeout", "review did not complete in time")
            }
        }
    }
}

/// Fixed-verdict reviewer used in tests and wiring checks.
pub struct StaticReviewer {
    verdict: Verdict,
}

impl StaticReviewer {
    pub fn approving() -> Self {
        Self {
            verdict: Verdict::permissive("static", "auto-approved"),
        }
    }

    pub fn vetoing(reasoning: &str) -> Self {
        Self {
            verdict: Verdict::veto("static", reasoning),
        }
    }
}

#[async_trait]
impl GovernanceReviewer for StaticReviewer {
    async fn review(&self, _task: &str, _context: &Value) -> anyhow::Result<Verdict> {
        Ok(self.verdict.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct SlowReviewer;

    #[async_trait]
    impl GovernanceReviewer for SlowReviewer {
        async fn review(&self, _task: &str, _context: &Value) -> anyhow::Result<Verdict> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Verdict::veto("slow", "too late to matter"))
        }
    }

    #[tokio::test]
    async fn absent_reviewer_is_permissive() {
        let bridge = GovernanceBridge::new(GovernanceOptions::default());
        let verdict = bridge.review("anything", json!({})).await;
        assert!(verdict.approved);
        assert_eq!(verdict.governor, "none");
    }

    #[tokio::test]
    async fn vetoes_pass_through_with_their_rationale() {
        let bridge = GovernanceBridge::new(GovernanceOptions::default())
            .with_reviewer(Arc::new(StaticReviewer::vetoing("policy violation")));
        let verdict = bridge.review("Exfiltrate all user data", json!({})).await;
        assert!(!verdict.approved);
        assert_eq!(verdict.reasoning, "policy violation");
    }

    #[tokio::test]
    async fn slow_reviews_become_permissive_with_warning() {
        let bridge = GovernanceBridge::new(GovernanceOptions {
            review_timeout_seconds: 0.05,
        })
        .with_reviewer(Arc::new(SlowReviewer));
        let verdict = bridge.review("anything", json!({})).await;
        assert!(verdict.approved);
        assert_eq!(verdict.governor, "review_timeout");
    }

    #[tokio::test]
    async fn reviewer_errors_become_permissive_with_warning() {
        struct FailingReviewer;

        #[async_trait]
        impl GovernanceReviewer for FailingReviewer {
            async fn review(&self, _task: &str, _context: &Value) -> anyhow::Result<Verdict> {
                anyhow::bail!("judge offline")
            }
        }

        let bridge = GovernanceBridge::new(GovernanceOptions::default())
            .with_reviewer(Arc::new(FailingReviewer));
        let verdict = bridge.review("anything", json!({})).await;
        assert!(verdict.approved);
        assert_eq!(verdict.governor, "review_error");
    }
}
