//! Error taxonomy for gate evaluation.
//!
//! Verdicts are never errors. `block` and `require_approval` are successful
//! evaluations; only malformed input and unexpected failures surface here.

use serde::Serialize;
use thiserror::Error;

/// Machine-readable error class, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidInput,
    VerificationFailed,
    DependencyMissing,
    IoFailure,
    StateContention,
    InternalFailure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::VerificationFailed => "verification_failed",
            ErrorCategory::DependencyMissing => "dependency_missing",
            ErrorCategory::IoFailure => "io_failure",
            ErrorCategory::StateContention => "state_contention",
            ErrorCategory::InternalFailure => "internal_failure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("verification failed: {message}")]
    Verification { code: &'static str, message: String },

    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state contention: {0}")]
    StateContention(String),

    #[error("internal failure: {0}")]
    Internal(String),
}

impl GateError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        GateError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            GateError::InvalidIntent(_) | GateError::InvalidPolicy(_) | GateError::InvalidInput(_) => {
                ErrorCategory::InvalidInput
            }
            GateError::Verification { .. } => ErrorCategory::VerificationFailed,
            GateError::DependencyMissing(_) => ErrorCategory::DependencyMissing,
            GateError::Io { .. } => ErrorCategory::IoFailure,
            GateError::StateContention(_) => ErrorCategory::StateContention,
            GateError::Internal(_) => ErrorCategory::InternalFailure,
        }
    }

    /// Reason code reported next to the human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::InvalidIntent(_) => "intent_invalid",
            GateError::InvalidPolicy(_) => "policy_invalid",
            GateError::InvalidInput(_) => "input_invalid",
            GateError::Verification { code, .. } => code,
            GateError::DependencyMissing(_) => "dependency_missing",
            GateError::Io { .. } => "io_failure",
            GateError::StateContention(_) => "state_contention",
            GateError::Internal(_) => "internal_failure",
        }
    }

    /// Process exit code for CLI surfaces.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::InvalidInput => 6,
            ErrorCategory::VerificationFailed => 2,
            ErrorCategory::DependencyMissing => 7,
            ErrorCategory::IoFailure
            | ErrorCategory::StateContention
            | ErrorCategory::InternalFailure => 1,
        }
    }
}

/// Canonicalization and encoding helpers report through `anyhow`; anything
/// that reaches the gate that way is unexpected.
impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        GateError::Internal(format!("{err:#}"))
    }
}
