//! Error taxonomy for the sandbox subsystem.
//!
//! Every distinguishable failure mode of [`SandboxManager::execute`](crate::sandbox::SandboxManager::execute)
//! has its own variant and a stable, machine-readable code. Callers map
//! these to user-visible states ("already running", "confirmation
//! rejected", ...) without parsing messages.

use std::path::PathBuf;
use thiserror::Error;

use crate::sandbox::{BackendKind, RiskLevel};

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("invalid execution request: {0}")]
    Validation(String),

    #[error("session '{0}' already has an execution in progress")]
    ConcurrentAccess(String),

    #[error("path '{}' escapes the workspace root", .path.display())]
    PathTraversal { path: PathBuf },

    #[error("no eligible backend available for {level} risk")]
    NoEligibleBackend { level: RiskLevel },

    #[error("execution rejected by policy: {0}")]
    ExecutionRejected(String),

    #[error("confirmation timed out")]
    ConfirmationTimeout,

    #[error("confirmation rejected")]
    ConfirmationRejected,

    #[error("execution exceeded the {timeout_ms}ms deadline")]
    SandboxTimeout { timeout_ms: u64 },

    #[error("{backend} backend is not available: {reason}")]
    SandboxNotAvailable {
        backend: BackendKind,
        reason: String,
    },

    #[error("managed environment pool is exhausted ({capacity} environments busy)")]
    PoolExhausted { capacity: usize },

    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error codes exposed to callers alongside the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    ConcurrentAccess,
    PathTraversal,
    NoEligibleBackend,
    ExecutionRejected,
    ConfirmationTimeout,
    ConfirmationRejected,
    SandboxTimeout,
    SandboxNotAvailable,
    PoolExhausted,
    ExecutionCancelled,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ConcurrentAccess => "CONCURRENT_ACCESS",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::NoEligibleBackend => "NO_ELIGIBLE_BACKEND",
            Self::ExecutionRejected => "EXECUTION_REJECTED",
            Self::ConfirmationTimeout => "CONFIRMATION_TIMEOUT",
            Self::ConfirmationRejected => "CONFIRMATION_REJECTED",
            Self::SandboxTimeout => "SANDBOX_TIMEOUT",
            Self::SandboxNotAvailable => "SANDBOX_NOT_AVAILABLE",
            Self::PoolExhausted => "POOL_EXHAUSTED",
            Self::ExecutionCancelled => "EXECUTION_CANCELLED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SandboxError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::ConcurrentAccess(_) => ErrorCode::ConcurrentAccess,
            Self::PathTraversal { .. } => ErrorCode::PathTraversal,
            Self::NoEligibleBackend { .. } => ErrorCode::NoEligibleBackend,
            Self::ExecutionRejected(_) => ErrorCode::ExecutionRejected,
            Self::ConfirmationTimeout => ErrorCode::ConfirmationTimeout,
            Self::ConfirmationRejected => ErrorCode::ConfirmationRejected,
            Self::SandboxTimeout { .. } => ErrorCode::SandboxTimeout,
            Self::SandboxNotAvailable { .. } => ErrorCode::SandboxNotAvailable,
            Self::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            Self::Cancelled(_) => ErrorCode::ExecutionCancelled,
            Self::Io(_) | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the failure means the code was never handed to an executor.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::ConcurrentAccess(_)
                | Self::NoEligibleBackend { .. }
                | Self::ExecutionRejected(_)
                | Self::ConfirmationTimeout
                | Self::ConfirmationRejected
        )
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Io(err.to_string())
    }
}
