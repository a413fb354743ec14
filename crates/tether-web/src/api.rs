use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tether_protocol::{ChatResponse, CommandOutput, EditOperation, FileEdited};
use tether_session::{Attachments, SessionError, Task};

use crate::AppState;

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Map a session failure onto the closest HTTP status.
pub fn error_response(err: SessionError) -> (StatusCode, String) {
    if err.is_connection() {
        return (StatusCode::BAD_GATEWAY, err.to_string());
    }
    let status = match &err {
        SessionError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SessionError::Backend { message, .. } => {
            return (StatusCode::BAD_GATEWAY, message.clone());
        }
        SessionError::UnknownTask(_) => StatusCode::NOT_FOUND,
        SessionError::TaskInactive(_) | SessionError::NotAwaitingApproval { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// POST /api/chat
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> ApiResult<ChatResponse> {
    let attachments = Attachments {
        files: body.files,
        images: body.images,
    };
    state
        .session
        .chat(body.message, attachments)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct CommandBody {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// POST /api/commands
pub async fn run_command(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CommandBody>,
) -> ApiResult<CommandOutput> {
    state
        .session
        .run_command(body.command, body.cwd)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct EditBody {
    pub content: String,
    #[serde(default)]
    pub operation: Option<EditOperation>,
}

/// POST /api/files/{*path} - create or modify (the default).
pub async fn edit_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Json(body): Json<EditBody>,
) -> ApiResult<FileEdited> {
    let operation = body.operation.unwrap_or(EditOperation::Modify);
    if operation == EditOperation::Delete {
        return Err((
            StatusCode::BAD_REQUEST,
            "use DELETE /api/files/{path} to delete".to_string(),
        ));
    }
    state
        .session
        .edit_file(path, body.content, operation)
        .await
        .map(Json)
        .map_err(error_response)
}

/// DELETE /api/files/{*path}
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> ApiResult<FileEdited> {
    state
        .session
        .edit_file(path, String::new(), EditOperation::Delete)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub connected: bool,
    pub pending_requests: usize,
    pub tasks: Vec<Task>,
}

/// GET /api/status - connection state and every known task.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusView> {
    let session = &state.session;
    Json(StatusView {
        connected: !session.is_closed(),
        pending_requests: session.pending_requests(),
        tasks: session.tasks(),
    })
}

/// GET /api/status/{task_id}
pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Task> {
    state
        .session
        .task(&task_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown task: {task_id}")))
}

/// POST /api/tasks/{task_id}/cancel - resolves once the backend acknowledges.
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Task> {
    state
        .session
        .cancel_task(&task_id)
        .await
        .map_err(error_response)?;
    snapshot(&state, &task_id)
}

#[derive(Debug, Deserialize)]
pub struct ApprovalBody {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// POST /api/tasks/{task_id}/approval
pub async fn approval(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(body): Json<ApprovalBody>,
) -> ApiResult<Task> {
    state
        .session
        .respond_approval(&task_id, body.approved, body.feedback)
        .await
        .map_err(error_response)?;
    snapshot(&state, &task_id)
}

fn snapshot(state: &AppState, task_id: &str) -> ApiResult<Task> {
    state
        .session
        .task(task_id)
        .map(Json)
        .ok_or_else(|| error_response(SessionError::UnknownTask(task_id.to_string())))
}
