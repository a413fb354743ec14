use tether_protocol::{CorrelationId, EncodeError, TaskId};
use thiserror::Error;

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Errors surfaced to facade callers.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("timed out after {timeout_ms}ms waiting for {expected} (correlation_id={correlation_id})")]
    Timeout {
        correlation_id: CorrelationId,
        expected: String,
        timeout_ms: u64,
    },

    #[error("transport closed")]
    TransportClosed,

    #[error("backend error: {message}")]
    Backend {
        message: String,
        code: Option<String>,
    },

    #[error("unexpected {kind} payload for correlation_id={correlation_id}")]
    UnexpectedPayload {
        correlation_id: CorrelationId,
        kind: String,
    },

    #[error("correlation id already pending: {0}")]
    DuplicateCorrelation(CorrelationId),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("task is no longer active: {0}")]
    TaskInactive(TaskId),

    #[error("task {task_id} is {status}, not awaiting approval")]
    NotAwaitingApproval { task_id: TaskId, status: String },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("io error: {0}")]
    Io(String),
}

impl SessionError {
    /// True for conditions caused by the connection rather than the request.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::TransportClosed | Self::Io(_))
    }
}

impl From<EncodeError> for SessionError {
    fn from(err: EncodeError) -> Self {
        SessionError::Encode(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}
