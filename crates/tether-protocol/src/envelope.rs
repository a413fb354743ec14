use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    ApprovalResponse, CancelRequest, ChatRequest, ChatResponse, CommandOutput, CommandRun,
    CorrelationId, ErrorPayload, FileEdit, FileEdited, Kind, StatusUpdate, TaskId,
};

/// Kind-specific body of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    ChatRequest(ChatRequest),
    ChatResponse(ChatResponse),
    FileEdit(FileEdit),
    FileEdited(FileEdited),
    CommandRun(CommandRun),
    CommandOutput(CommandOutput),
    TaskStatus(StatusUpdate),
    TaskCancel(CancelRequest),
    TaskApproval(ApprovalResponse),
    Error(ErrorPayload),
    /// Body of an unrecognized wire type, kept verbatim.
    Unknown {
        wire_type: String,
        body: serde_json::Value,
    },
}

impl Payload {
    pub fn kind(&self) -> Kind {
        match self {
            Payload::ChatRequest(_) => Kind::ChatRequest,
            Payload::ChatResponse(_) => Kind::ChatResponse,
            Payload::FileEdit(_) => Kind::FileEdit,
            Payload::FileEdited(_) => Kind::FileEdited,
            Payload::CommandRun(_) => Kind::CommandRun,
            Payload::CommandOutput(_) => Kind::CommandOutput,
            Payload::TaskStatus(_) => Kind::TaskStatus,
            Payload::TaskCancel(_) => Kind::TaskCancel,
            Payload::TaskApproval(_) => Kind::TaskApproval,
            Payload::Error(_) => Kind::Error,
            Payload::Unknown { wire_type, .. } => Kind::Unknown(wire_type.clone()),
        }
    }

    /// The task this payload refers to, when it names one.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Payload::ChatResponse(p) => p.task_id.as_ref(),
            Payload::FileEdited(p) => p.task_id.as_ref(),
            Payload::CommandOutput(p) => p.task_id.as_ref(),
            Payload::TaskStatus(p) => Some(&p.task_id),
            Payload::TaskCancel(p) => Some(&p.task_id),
            Payload::TaskApproval(p) => Some(&p.task_id),
            _ => None,
        }
    }

    pub(crate) fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Payload::ChatRequest(p) => serde_json::to_value(p),
            Payload::ChatResponse(p) => serde_json::to_value(p),
            Payload::FileEdit(p) => serde_json::to_value(p),
            Payload::FileEdited(p) => serde_json::to_value(p),
            Payload::CommandRun(p) => serde_json::to_value(p),
            Payload::CommandOutput(p) => serde_json::to_value(p),
            Payload::TaskStatus(p) => serde_json::to_value(p),
            Payload::TaskCancel(p) => serde_json::to_value(p),
            Payload::TaskApproval(p) => serde_json::to_value(p),
            Payload::Error(p) => serde_json::to_value(p),
            Payload::Unknown { body, .. } => Ok(body.clone()),
        }
    }

    pub(crate) fn from_value(
        kind: &Kind,
        value: serde_json::Value,
    ) -> Result<Payload, serde_json::Error> {
        Ok(match kind {
            Kind::ChatRequest => Payload::ChatRequest(serde_json::from_value(value)?),
            Kind::ChatResponse => Payload::ChatResponse(serde_json::from_value(value)?),
            Kind::FileEdit => Payload::FileEdit(serde_json::from_value(value)?),
            Kind::FileEdited => Payload::FileEdited(serde_json::from_value(value)?),
            Kind::CommandRun => Payload::CommandRun(serde_json::from_value(value)?),
            Kind::CommandOutput => Payload::CommandOutput(serde_json::from_value(value)?),
            Kind::TaskStatus => Payload::TaskStatus(serde_json::from_value(value)?),
            Kind::TaskCancel => Payload::TaskCancel(serde_json::from_value(value)?),
            Kind::TaskApproval => Payload::TaskApproval(serde_json::from_value(value)?),
            Kind::Error => Payload::Error(serde_json::from_value(value)?),
            Kind::Unknown(ty) => Payload::Unknown {
                wire_type: ty.clone(),
                body: value,
            },
        })
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Correlation id. Echoed by every response and event of an exchange.
    pub id: CorrelationId,
    pub payload: Payload,
    /// Milliseconds since the Unix epoch. Diagnostics only.
    pub timestamp: u64,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(id: impl Into<CorrelationId>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
            timestamp: now_ms(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.payload.kind()
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
