//! JSON-lines codec for envelopes.
//!
//! A frame is one JSON object without the trailing newline:
//! `{"id": "...", "type": "chat", "payload": {...}, "timestamp": 1700000000000}`.
//! Decoding never panics. Malformed frames come back as [`DecodeError`]
//! carrying the raw text, and unknown `type` values decode into
//! [`Payload::Unknown`] so newer peers keep working.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Envelope, Kind, Payload};

/// Which way frames travel, used to resolve the shared wire `type` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → backend (requests and control messages).
    ToBackend,
    /// Backend → client (responses and events).
    ToClient,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {reason}")]
    Malformed { raw: String, reason: String },

    #[error("frame has no correlation id")]
    MissingId { raw: String },

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        kind: String,
        raw: String,
        reason: String,
    },
}

impl DecodeError {
    /// The frame that failed to decode.
    pub fn raw(&self) -> &str {
        match self {
            DecodeError::Malformed { raw, .. }
            | DecodeError::MissingId { raw }
            | DecodeError::InvalidPayload { raw, .. } => raw,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to encode {kind} envelope: {source}")]
pub struct EncodeError {
    pub kind: String,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Serialize)]
struct WireOut<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    ty: &'a str,
    payload: serde_json::Value,
    timestamp: u64,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    timestamp: Option<serde_json::Number>,
}

/// Envelope codec bound to the direction of the frames it decodes.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    inbound: Direction,
}

impl Codec {
    /// Codec for the editor side: decodes backend → client frames.
    pub fn client() -> Self {
        Self {
            inbound: Direction::ToClient,
        }
    }

    /// Codec for the backend side: decodes client → backend frames.
    pub fn backend() -> Self {
        Self {
            inbound: Direction::ToBackend,
        }
    }

    pub fn inbound(&self) -> Direction {
        self.inbound
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<String, EncodeError> {
        let kind = envelope.kind();
        let to_err = |source| EncodeError {
            kind: kind.to_string(),
            source,
        };
        let wire = WireOut {
            id: &envelope.id,
            ty: kind.wire_type(),
            payload: envelope.payload.to_value().map_err(to_err)?,
            timestamp: envelope.timestamp,
        };
        serde_json::to_string(&wire).map_err(to_err)
    }

    pub fn decode(&self, frame: &str) -> Result<Envelope, DecodeError> {
        let wire: WireIn =
            serde_json::from_str(frame).map_err(|err| DecodeError::Malformed {
                raw: frame.to_string(),
                reason: err.to_string(),
            })?;

        if wire.id.is_empty() {
            return Err(DecodeError::MissingId {
                raw: frame.to_string(),
            });
        }

        let kind = Kind::from_wire(&wire.ty, self.inbound);
        let payload =
            Payload::from_value(&kind, wire.payload).map_err(|err| DecodeError::InvalidPayload {
                kind: kind.to_string(),
                raw: frame.to_string(),
                reason: err.to_string(),
            })?;

        let timestamp = wire
            .timestamp
            .and_then(|n| n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)))
            .unwrap_or(0);

        Ok(Envelope {
            id: wire.id,
            payload,
            timestamp,
        })
    }
}
