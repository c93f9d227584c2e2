//! Error types for billsync.
//!
//! Errors are strongly typed using thiserror so callers can match on
//! the failure class. Rollback always happens inside the engine before
//! any of these leave it, so an error never implies an inconsistent store.

use thiserror::Error;

/// Validation errors raised before any optimistic mutation is applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Vendor is empty or whitespace.
    #[error("Vendor name cannot be empty")]
    EmptyVendor,

    /// Amount is negative, NaN or infinite.
    #[error("Amount {value} must be a finite, non-negative number")]
    InvalidAmount {
        value: f64,
    },

    /// Frequency string not recognized.
    #[error("Unknown frequency '{value}'")]
    UnknownFrequency {
        value: String,
    },

    /// Appearance mode string not recognized.
    #[error("Unknown appearance mode '{value}'")]
    UnknownAppearanceMode {
        value: String,
    },

    /// Configuration rejected.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors reported by a [`RemoteGateway`](crate::gateway::RemoteGateway).
///
/// The engine only distinguishes success from failure, with one exception:
/// a `Cancelled` list call triggered by the engine itself is swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The server could not be reached.
    #[error("Transport failure: {message}")]
    Transport {
        message: String,
    },

    /// The server refused the request.
    #[error("Request rejected: {message}")]
    Rejected {
        message: String,
    },

    /// The request was cancelled by its token.
    #[error("Request cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Returns true if this is a cooperative cancellation signal.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Kind of optimistic mutation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    /// Create.
    Create,
    /// Update.
    Update,
    /// Delete.
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Top-level error type for billsync.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Input failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A gateway call failed.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// A mutation was rejected and the store has been rolled back.
    #[error("Could not {operation} recurring bill: {message}")]
    MutationFailed {
        operation: MutationKind,
        message: String,
        #[source]
        cause: GatewayError,
    },

    /// The live refresh failed; the store kept its contents.
    #[error("Refresh failed: {message}")]
    RefreshFailed {
        message: String,
    },

    /// Previous status results remain available.
    #[error("Status lookup failed: {message}")]
    StatusFailed {
        message: String,
    },

    /// Engine-internal failure, such as a poisoned lock.
    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SyncError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wraps a gateway failure of a rolled-back mutation.
    #[must_use]
    pub fn mutation(operation: MutationKind, cause: GatewayError) -> Self {
        let message = match &cause {
            GatewayError::Transport { .. } => {
                "the server could not be reached, your change was undone".to_string()
            }
            GatewayError::Rejected { message } => format!("the server refused the change ({message})"),
            GatewayError::Cancelled => "the request was cancelled, your change was undone".to_string(),
        };
        Self::MutationFailed {
            operation,
            message,
            cause,
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this error came from the gateway (directly or after rollback).
    #[must_use]
    pub const fn is_gateway(&self) -> bool {
        matches!(self, Self::Gateway(_) | Self::MutationFailed { .. })
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Gateway(e) | Self::MutationFailed { cause: e, .. } => {
                matches!(e, GatewayError::Transport { .. })
            }
            Self::RefreshFailed { .. } | Self::StatusFailed { .. } => true,
        }
    }
}

/// Result type alias for billsync operations.
pub type SyncResult<T> = Result<T, SyncError>;
