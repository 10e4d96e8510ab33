// src/utils/errors.rs
//! Error types for the isolation engine
//!
//! Identity and isolation errors are fatal to the operation that raised
//! them. Factory errors are recoverable by the caller. Monitoring code never
//! returns errors into the request path; it logs and degrades instead.

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while building or comparing execution contexts
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    /// Malformed, empty or placeholder identity field
    #[error("invalid context field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// Two contexts that must be independent share identity or state
    #[error("context isolation violated: {0}")]
    Isolation(String),
}

impl ContextError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors raised by the execution engine factory
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FactoryError {
    /// The user already holds the maximum number of concurrent engines
    #[error("user {user_id} reached the concurrent engine limit ({active}/{limit})")]
    UserLimitExceeded {
        user_id: String,
        active: usize,
        limit: usize,
    },

    /// The notification channel for the engine could not be established
    #[error("notification channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The factory no longer accepts new engines
    #[error("execution engine factory is shut down")]
    ShutDown,
}

impl FactoryError {
    /// True when the caller should surface a "busy" condition
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::UserLimitExceeded { .. })
    }

    /// True when retrying later (with backoff) may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ShutDown)
    }
}

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error("Notification channel failed: {0}")]
    ChannelFailed(String),

    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("Health probe failed: {0}")]
    ProbeFailed(String),

    #[error("Alert delivery failed: {0}")]
    AlertFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Observability error: {0}")]
    ObservabilityError(String),
}

impl EngineError {
    /// True for errors that indicate a correctness bug rather than load
    pub fn is_isolation_breach(&self) -> bool {
        matches!(self, Self::Context(ContextError::Isolation(_)))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        Self::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_error_classification() {
        let busy = FactoryError::UserLimitExceeded {
            user_id: "user_a".into(),
            active: 2,
            limit: 2,
        };
        assert!(busy.is_capacity());
        assert!(busy.is_retryable());

        assert!(!FactoryError::ShutDown.is_capacity());
        assert!(!FactoryError::ShutDown.is_retryable());
        assert!(FactoryError::ChannelUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn test_isolation_breach_detection() {
        let err: EngineError = ContextError::Isolation("shared thread".into()).into();
        assert!(err.is_isolation_breach());

        let err: EngineError = ContextError::invalid("user_id", "empty").into();
        assert!(!err.is_isolation_breach());
        assert_eq!(err.to_string(), "invalid context field `user_id`: empty");
    }
}
