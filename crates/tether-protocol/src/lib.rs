pub mod codec;
pub mod envelope;
pub mod paths;

pub use codec::{Codec, DecodeError, Direction, EncodeError};
pub use envelope::{Envelope, Payload};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum size of a JSON-lines frame on the transport (1 MiB).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Opaque token linking a request to its responses and events.
pub type CorrelationId = String;

/// Identifier of a backend task; distinct from any correlation id.
pub type TaskId = String;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Semantic type of an envelope.
///
/// The wire `type` string is shared by both directions of an exchange
/// (`"chat"` is used for the request and its response), so the kind is
/// resolved together with the decoding [`Direction`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Kind {
    ChatRequest,
    ChatResponse,
    FileEdit,
    FileEdited,
    CommandRun,
    CommandOutput,
    TaskStatus,
    TaskCancel,
    TaskApproval,
    Error,
    /// A wire type this build does not recognize.
    Unknown(String),
}

impl Kind {
    /// The `type` string used on the wire.
    pub fn wire_type(&self) -> &str {
        match self {
            Kind::ChatRequest | Kind::ChatResponse => "chat",
            Kind::FileEdit | Kind::FileEdited => "fileEdit",
            Kind::CommandRun | Kind::CommandOutput => "command",
            Kind::TaskStatus => "status",
            Kind::TaskCancel => "cancel",
            Kind::TaskApproval => "approval",
            Kind::Error => "error",
            Kind::Unknown(ty) => ty,
        }
    }

    /// Resolve a wire `type` string for frames travelling in `direction`.
    pub fn from_wire(ty: &str, direction: Direction) -> Kind {
        match (direction, ty) {
            (_, "error") => Kind::Error,
            (Direction::ToClient, "chat") => Kind::ChatResponse,
            (Direction::ToClient, "fileEdit") => Kind::FileEdited,
            (Direction::ToClient, "command") => Kind::CommandOutput,
            (Direction::ToClient, "status") => Kind::TaskStatus,
            (Direction::ToBackend, "chat") => Kind::ChatRequest,
            (Direction::ToBackend, "fileEdit") => Kind::FileEdit,
            (Direction::ToBackend, "command") => Kind::CommandRun,
            (Direction::ToBackend, "cancel") => Kind::TaskCancel,
            (Direction::ToBackend, "approval") => Kind::TaskApproval,
            (_, other) => Kind::Unknown(other.to_string()),
        }
    }

    /// Dotted name used in logs, e.g. `chat.response`.
    pub fn as_str(&self) -> &str {
        match self {
            Kind::ChatRequest => "chat.request",
            Kind::ChatResponse => "chat.response",
            Kind::FileEdit => "file.edit",
            Kind::FileEdited => "file.edited",
            Kind::CommandRun => "command.run",
            Kind::CommandOutput => "command.output",
            Kind::TaskStatus => "task.status",
            Kind::TaskCancel => "task.cancel",
            Kind::TaskApproval => "task.approval",
            Kind::Error => "error",
            Kind::Unknown(ty) => ty,
        }
    }

    /// Parse a dotted kind name (the inverse of [`Kind::as_str`]).
    pub fn parse(name: &str) -> Kind {
        match name {
            "chat.request" => Kind::ChatRequest,
            "chat.response" => Kind::ChatResponse,
            "file.edit" => Kind::FileEdit,
            "file.edited" => Kind::FileEdited,
            "command.run" => Kind::CommandRun,
            "command.output" => Kind::CommandOutput,
            "task.status" => Kind::TaskStatus,
            "task.cancel" => Kind::TaskCancel,
            "task.approval" => Kind::TaskApproval,
            "error" => Kind::Error,
            other => Kind::Unknown(other.to_string()),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Kind::Unknown(_))
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `chat` request payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

/// `chat` response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// What a `fileEdit` request does to the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditOperation {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for EditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditOperation::Create => write!(f, "create"),
            EditOperation::Modify => write!(f, "modify"),
            EditOperation::Delete => write!(f, "delete"),
        }
    }
}

/// `fileEdit` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEdit {
    pub path: String,
    pub content: String,
    pub operation: EditOperation,
}

/// `fileEdit` acknowledgement event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEdited {
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// `command` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRun {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// `command` output event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub command: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// `status` event for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusUpdate {
    /// The parsed state, or `None` for a state string this build does not know.
    pub fn task_state(&self) -> Option<TaskState> {
        TaskState::parse(&self.state)
    }
}

/// Task states reported by the backend in `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    NeedsApproval,
    Done,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn parse(state: &str) -> Option<Self> {
        match state {
            "running" => Some(TaskState::Running),
            "needs-approval" => Some(TaskState::NeedsApproval),
            "done" => Some(TaskState::Done),
            "error" => Some(TaskState::Error),
            "cancelled" => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Running => "running",
            TaskState::NeedsApproval => "needs-approval",
            TaskState::Done => "done",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `cancel` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub task_id: TaskId,
}

/// `approval` response payload, answering a `needs-approval` status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub task_id: TaskId,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
