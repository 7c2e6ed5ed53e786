use std::path::PathBuf;

use thiserror::Error;

use crate::graph::PermissionScope;

/// Core error type for taskloom.
#[derive(Debug, Error)]
pub enum TaskloomError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("graph error: {0}")]
    Graph(String),
    #[error("planning error: {0}")]
    Planning(String),
    #[error("event bus error: {0}")]
    Bus(String),
    #[error("task queue error: {0}")]
    Queue(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("vault error: {0}")]
    Vault(String),
    #[error("tier limit exceeded: {0}")]
    TierLimit(String),
    #[error("orchestration error: {0}")]
    Orchestration(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskloomError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Error raised by a single handler invocation.
///
/// The runtime and the orchestrator decide what to do with it based on
/// [`HandlerError::retryable`]: transient handler failures go through the
/// retry policy, everything else fails the node immediately.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("handler is disabled")]
    Disabled,
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("permission denied, missing scopes: {missing:?}")]
    PermissionDenied { missing: Vec<PermissionScope> },
    #[error("rate limited, retry after {retry_after_seconds:.0}s")]
    RateLimited { retry_after_seconds: f64 },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("cost budget exceeded")]
    BudgetExceeded,
    #[error("handler failure: {0}")]
    Failed(String),
}

impl HandlerError {
    /// Only ordinary handler failures are candidates for retry. Policy
    /// denials and breaker fast-fails are surfaced to the caller as-is.
    pub fn retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_failures_are_retryable() {
        assert!(HandlerError::failed("timeout").retryable());
        assert!(!HandlerError::CircuitOpen.retryable());
        assert!(!HandlerError::Disabled.retryable());
        assert!(
            !HandlerError::PermissionDenied {
                missing: vec![PermissionScope::Admin]
            }
            .retryable()
        );
        assert!(
            !HandlerError::RateLimited {
                retry_after_seconds: 720.0
            }
            .retryable()
        );
        assert!(!HandlerError::ValidationFailed("bad shape".into()).retryable());
    }
}
