//! # Kernel Error Types
//!
//! Every kernel operation returns success or exactly one of these. The
//! category decides what a caller may do next: validation, permission and
//! not-found errors are final for that call; conflict and transient errors
//! may be retried as-is.

use conductor_traits::StoreError;
use std::fmt;
use thiserror::Error;

/// Result type alias for kernel operations
pub type Result<T> = std::result::Result<T, KernelError>;

/// Error code prefix
pub const ERROR_CODE_PREFIX: &str = "CND";

/// Error category classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Validation,
    Permission,
    NotFound,
    Conflict,
    Transient,
    Internal,
}

impl ErrorCategory {
    /// Short code for this category
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "VAL",
            ErrorCategory::Permission => "PRM",
            ErrorCategory::NotFound => "NFD",
            ErrorCategory::Conflict => "CFL",
            ErrorCategory::Transient => "TRN",
            ErrorCategory::Internal => "INT",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Permission => "permission",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Core error types for the kernel
#[derive(Error, Debug)]
pub enum KernelError {
    /// Malformed input or a structural invariant violation (cycle, unknown id)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Actor lacks the capability for this field or transition
    #[error("Permission denied: {0}")]
    Permission(String),

    /// State transition outside the session state machine
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Valid request that cannot proceed against current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persistence unavailable; the same call may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Corrupt stored data or a broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KernelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    pub fn invalid_transition(
        entity: impl Into<String>,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity: entity.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            KernelError::Validation(_) | KernelError::Configuration(_) => {
                ErrorCategory::Validation
            }
            KernelError::Permission(_) | KernelError::InvalidTransition { .. } => {
                ErrorCategory::Permission
            }
            KernelError::NotFound(_) => ErrorCategory::NotFound,
            KernelError::Conflict(_) => ErrorCategory::Conflict,
            KernelError::Transient(_) => ErrorCategory::Transient,
            KernelError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Machine-readable code, e.g. `CND-PRM`.
    pub fn code(&self) -> String {
        format!("{}-{}", ERROR_CODE_PREFIX, self.category().code())
    }

    /// Whether the caller may retry the exact same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Conflict | ErrorCategory::Transient
        )
    }
}

impl From<StoreError> for KernelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => KernelError::Transient(msg),
            StoreError::Serialization(msg) => {
                KernelError::Internal(format!("stored record is corrupt: {}", msg))
            }
        }
    }
}
