use thiserror::Error;

use crate::node::NodeId;
use crate::task::TaskId;

/// Result alias used across the scheduler boundary.
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors surfaced by the control plane.
///
/// The string codes returned by [`MeshError::code`] are a stable contract
/// with callers; transports map them to their own status conventions.
/// Only [`MeshError::Storage`] is retryable — the scheduler never retries
/// it internally.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("node is revoked: {0}")]
    NodeRevoked(NodeId),

    #[error("node bootstrap denied")]
    NodeBootstrapDenied,

    #[error("token expired")]
    TokenExpired,

    #[error("token already used")]
    TokenReplay,

    #[error("job token is not bound to task {0}")]
    TokenJobMismatch(TaskId),

    #[error("node token does not match node {0}")]
    TokenNodeMismatch(NodeId),

    #[error("token signature invalid")]
    TokenSignatureInvalid,

    #[error("node token missing")]
    MissingNodeToken,

    #[error("job token missing")]
    MissingJobToken,

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task already terminal: {0}")]
    TaskAlreadyTerminal(TaskId),

    #[error("dead-letter entry not found: {0}")]
    DlqEntryNotFound(TaskId),

    #[error("unauthorized")]
    Unauthorized,

    /// Opaque transient backend failure. Retryable by the caller.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl MeshError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownNode(_) => "unknown_node",
            Self::NodeRevoked(_) => "node_revoked",
            Self::NodeBootstrapDenied => "node_bootstrap_denied",
            Self::TokenExpired => "token_expired",
            Self::TokenReplay => "token_replay",
            Self::TokenJobMismatch(_) => "token_job_mismatch",
            Self::TokenNodeMismatch(_) => "token_node_mismatch",
            Self::TokenSignatureInvalid => "token_signature_invalid",
            Self::MissingNodeToken => "missing_node_token",
            Self::MissingJobToken => "missing_job_token",
            Self::TaskNotFound(_) => "task_not_found",
            Self::TaskAlreadyTerminal(_) => "task_already_terminal",
            Self::DlqEntryNotFound(_) => "dlq_entry_not_found",
            Self::Unauthorized => "unauthorized",
            Self::Storage(_) => "storage",
        }
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(MeshError::UnknownNode(NodeId::from("n1")).code(), "unknown_node");
        assert_eq!(MeshError::TaskAlreadyTerminal(TaskId::from("t1")).code(), "task_already_terminal");
        assert_eq!(MeshError::Unauthorized.code(), "unauthorized");
    }

    #[test]
    fn only_storage_is_retryable() {
        assert!(MeshError::Storage(anyhow::anyhow!("connection reset")).is_retryable());
        assert!(!MeshError::TokenExpired.is_retryable());
        assert!(!MeshError::TaskNotFound(TaskId::from("t")).is_retryable());
    }
}
