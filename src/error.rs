//! Error taxonomy for the orchestration core.
//!
//! Contract-facing boundaries return a typed error so callers can match on
//! the §7 error taxonomy instead of parsing strings; everything else
//! (internal plumbing, async task bodies) returns `anyhow::Result` with
//! `.context(...)` call sites, same split the rest of the crate follows.

use thiserror::Error;

/// The six abstract error kinds from the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network timeout, HTTP 5xx, disk ENOSPC — recovered by local retry.
    TransientIo,
    /// Tracker returned malformed data, adapter emitted out-of-order events.
    ContractViolation,
    /// 401/403 from tracker or agent, expired OAuth tokens.
    Authentication,
    /// User stop, manager shutdown. Not actually an error.
    Cancellation,
    /// Invalid repository config, missing credentials at startup.
    Configuration,
    /// The agent's own error event.
    AgentReported,
}

/// Fatal or contract-level errors raised by the orchestration core itself.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} already exists")]
    SessionAlreadyExists(String),

    #[error("issue {0} already has a live session")]
    IssueAlreadyHasSession(String),

    #[error("admission queue is full (capacity {0})")]
    AdmissionQueueFull(usize),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("agent reported error: {0}")]
    AgentReported(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Classifies this error into the abstract taxonomy from §7.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ContractViolation(_) => ErrorKind::ContractViolation,
            CoreError::Authentication(_) => ErrorKind::Authentication,
            CoreError::Configuration(_) => ErrorKind::Configuration,
            CoreError::AgentReported(_) => ErrorKind::AgentReported,
            CoreError::SessionNotFound(_)
            | CoreError::SessionAlreadyExists(_)
            | CoreError::IssueAlreadyHasSession(_)
            | CoreError::AdmissionQueueFull(_)
            | CoreError::Other(_) => ErrorKind::TransientIo,
        }
    }
}

/// Errors raised by the `SessionStorage` collaborator boundary (§4.1, §6).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to (de)serialize session snapshot: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while processing inbound webhooks (§4.7).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed webhook body: {0}")]
    MalformedBody(String),

    #[error("dispatch exceeded the ack timeout")]
    AckTimeout,
}

/// Extension trait mirroring the teacher's `context_op`/`context_path`
/// helpers for consistent "Failed to ..." error context.
pub trait ResultExt<T> {
    fn context_op(self, operation: &str) -> anyhow::Result<T>;
    fn context_path(self, operation: &str, path: &std::path::Path) -> anyhow::Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context_op(self, operation: &str) -> anyhow::Result<T> {
        use anyhow::Context;
        self.context(format!("Failed to {}", operation))
    }

    fn context_path(self, operation: &str, path: &std::path::Path) -> anyhow::Result<T> {
        use anyhow::Context;
        self.context(format!("Failed to {} at '{}'", operation, path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_contract_violation() {
        let err = CoreError::ContractViolation("out of order events".into());
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
    }

    #[test]
    fn classifies_authentication() {
        let err = CoreError::Authentication("expired token".into());
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn session_not_found_is_transient() {
        let err = CoreError::SessionNotFound("abc".into());
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }
}
