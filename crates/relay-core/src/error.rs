use thiserror::Error;

use crate::dispatch::ActionId;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cyclic dependency detected at action '{action}'")]
    CyclicDependency { action: String },

    #[error("action not found: {0}")]
    UnknownAction(ActionId),

    #[error("invalid action graph: {0}")]
    InvalidGraph(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Failure reported by an [`EventSender`](crate::queue::EventSender).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Transient failure; the batch stays queued and is retried with backoff.
    #[error("send failed (will retry): {0}")]
    Retryable(String),

    /// The receiver refused the batch; retrying would not help.
    #[error("send rejected: {0}")]
    Rejected(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Terminal error recorded against a single action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("action cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error("dependency '{dependency}' did not finish cleanly")]
    DependencyFailed { dependency: String },
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
