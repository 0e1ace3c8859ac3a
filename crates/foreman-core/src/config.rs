use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay_seconds: f64,
    pub cap_seconds: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_seconds: 1.0,
            cap_seconds: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerOptions {
    pub failure_threshold: u32,
    pub window_seconds: f64,
    pub cooldown_seconds: f64,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_seconds: 60.0,
            cooldown_seconds: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    pub max_connections: usize,
    pub max_keepalive: usize,
    pub keepalive_ttl_seconds: f64,
    pub queue_timeout_seconds: f64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 16,
            max_keepalive: 8,
            keepalive_ttl_seconds: 30.0,
            queue_timeout_seconds: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOptions {
    pub default_timeout_seconds: f64,
}

impl Default for ApprovalOptions {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceOptions {
    pub review_timeout_seconds: f64,
}

impl Default for GovernanceOptions {
    fn default() -> Self {
        Self {
            review_timeout_seconds: 5.0,
        }
    }
}

/// Every knob the runtime recognizes. Serde defaults let a TOML or JSON
/// fragment override any subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    pub max_parallel_tasks_per_session: usize,
    pub max_sessions: usize,
    pub auto_save_interval_seconds: f64,
    pub compression_threshold_bytes: usize,
    pub max_task_description_len: usize,
    pub worker_deadline_seconds: f64,
    pub cancellation_grace_seconds: f64,
    pub retry: RetryOptions,
    pub breaker: BreakerOptions,
    pub pool: PoolOptions,
    pub approval: ApprovalOptions,
    pub governance: GovernanceOptions,
    pub tracer: foreman_observability::TracerOptions,
    pub persistence_path: PathBuf,
    pub session_dir: PathBuf,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_parallel_tasks_per_session: 4,
            max_sessions: 50,
            auto_save_interval_seconds: 30.0,
            compression_threshold_bytes: 10 * 1024,
            max_task_description_len: 4096,
            worker_deadline_seconds: 120.0,
            cancellation_grace_seconds: 2.0,
            retry: RetryOptions::default(),
            breaker: BreakerOptions::default(),
            pool: PoolOptions::default(),
            approval: ApprovalOptions::default(),
            governance: GovernanceOptions::default(),
            tracer: foreman_observability::TracerOptions::default(),
            persistence_path: PathBuf::from(".foreman/foreman.db"),
            session_dir: PathBuf::from(".sessions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = RuntimeOptions::default();
        assert_eq!(options.retry.max_attempts, 3);
        assert_eq!(options.retry.cap_seconds, 30.0);
        assert_eq!(options.breaker.failure_threshold, 3);
        assert_eq!(options.approval.default_timeout_seconds, 30.0);
        assert_eq!(options.governance.review_timeout_seconds, 5.0);
        assert_eq!(options.max_sessions, 50);
        assert_eq!(options.compression_threshold_bytes, 10 * 1024);
    }

    #[test]
    fn partial_json_overrides_keep_remaining_defaults() {
        let options: RuntimeOptions = serde_json::from_str(
            r#"{"max_parallel_tasks_per_session": 2, "retry": {"max_attempts": 5, "base_delay_seconds": 0.5, "cap_seconds": 10.0}}"#,
        )
        .expect("parse");
        assert_eq!(options.max_parallel_tasks_per_session, 2);
        assert_eq!(options.retry.max_attempts, 5);
        assert_eq!(options.max_sessions, 50);
    }
}
