use serde::{Deserialize, Serialize};

/// Closed set of failure kinds surfaced by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    TransientNetwork,
    ServerError,
    BadRequest,
    AuthFailed,
    NotFound,
    CircuitOpen,
    PoolExhausted,
    GovernanceBlocked,
    ApprovalRejected,
    ApprovalTimedOut,
    SyntaxInvalid,
    EvaluationFailed,
    ChecksumMismatch,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::ServerError => "server_error",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::GovernanceBlocked => "governance_blocked",
            ErrorKind::ApprovalRejected => "approval_rejected",
            ErrorKind::ApprovalTimedOut => "approval_timed_out",
            ErrorKind::SyntaxInvalid => "syntax_invalid",
            ErrorKind::EvaluationFailed => "evaluation_failed",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Whether a retry wrapper may re-attempt a call that failed this way.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::TransientNetwork
                | ErrorKind::ServerError
        )
    }

    /// Fail-fast kinds are surfaced to callers as transient conditions.
    pub fn is_transient_to_caller(self) -> bool {
        self.is_retriable() || matches!(self, ErrorKind::CircuitOpen | ErrorKind::PoolExhausted)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type carried across component boundaries inside the runtime.
#[derive(Debug, Clone)]
pub struct OrchestrationError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl OrchestrationError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, detail)
    }
}

impl std::fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.detail.is_empty() {
            f.write_str(self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind, self.detail)
        }
    }
}

impl std::error::Error for OrchestrationError {}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retriable() {
        assert!(ErrorKind::RateLimited.is_retriable());
        assert!(ErrorKind::ServerError.is_retriable());
        assert!(!ErrorKind::BadRequest.is_retriable());
        assert!(!ErrorKind::GovernanceBlocked.is_retriable());
        assert!(!ErrorKind::CircuitOpen.is_retriable());
    }

    #[test]
    fn fail_fast_kinds_surface_as_transient() {
        assert!(ErrorKind::CircuitOpen.is_transient_to_caller());
        assert!(ErrorKind::PoolExhausted.is_transient_to_caller());
        assert!(!ErrorKind::AuthFailed.is_transient_to_caller());
    }

    #[test]
    fn display_includes_kind_and_detail() {
        let err = OrchestrationError::new(ErrorKind::Timeout, "worker deadline exceeded");
        assert_eq!(err.to_string(), "timeout: worker deadline exceeded");
    }
}
