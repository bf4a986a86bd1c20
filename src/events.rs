//! # Relay Event Vocabulary
//!
//! Typed versions of everything that crosses the WebSocket.
//!
//! ## Client → Server
//! Text frames carry `{"type": <event name>, "data": <payload>}`. The
//! recognized names are a closed set ([`EventName`]). The names used by the
//! older clients (`input_audio_buffer.*`, `sonju:summarize`) are
//! accepted as aliases. Older clients also wrap buffer events in an
//! `openai:conversation` envelope whose `data.type` names the real event;
//! the envelope itself is the payload. Binary frames are treated as a
//! `buffer.append` whose payload is the frame itself.
//!
//! ## Server → Client
//! [`ServerMessage`]: a greeting, one `ack` per routed event, and
//! asynchronous notifications for downstream results.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorKind, RelayError, RelayResult};
use crate::session::{ConnectionId, SessionState};

/// Envelope name whose `data.type` carries the actual event name.
pub const CONVERSATION_ENVELOPE: &str = "openai:conversation";

/// The recognized client event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    BufferAppend,
    BufferCommit,
    BufferEnd,
    Summarize,
}

impl EventName {
    pub const ALL: [EventName; 4] = [
        EventName::BufferAppend,
        EventName::BufferCommit,
        EventName::BufferEnd,
        EventName::Summarize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::BufferAppend => "buffer.append",
            EventName::BufferCommit => "buffer.commit",
            EventName::BufferEnd => "buffer.end",
            EventName::Summarize => "summarize",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buffer.append" | "input_audio_buffer.append" => Ok(EventName::BufferAppend),
            "buffer.commit" | "input_audio_buffer.commit" => Ok(EventName::BufferCommit),
            "buffer.end" | "input_audio_buffer.end" => Ok(EventName::BufferEnd),
            "summarize" | "sonju:summarize" => Ok(EventName::Summarize),
            other => Err(RelayError::UnknownEvent(other.to_string())),
        }
    }
}

/// A validated client event, ready for the session state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Append(Bytes),
    Commit,
    End,
    Summarize,
}

impl ClientEvent {
    pub fn name(&self) -> EventName {
        match self {
            ClientEvent::Append(_) => EventName::BufferAppend,
            ClientEvent::Commit => EventName::BufferCommit,
            ClientEvent::End => EventName::BufferEnd,
            ClientEvent::Summarize => EventName::Summarize,
        }
    }

    /// Validate a raw `(name, payload)` pair.
    ///
    /// The name is checked before the payload, so an unknown name is always
    /// reported as `UnknownEvent` whatever the payload looks like. For the
    /// `openai:conversation` envelope the name is `data.type`; a missing or
    /// unknown sub-type is also `UnknownEvent`.
    pub fn parse(name: &str, data: &Value) -> RelayResult<Self> {
        let name = if name == CONVERSATION_ENVELOPE {
            data.get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| RelayError::UnknownEvent(CONVERSATION_ENVELOPE.to_string()))?
        } else {
            name
        };

        match name.parse::<EventName>()? {
            EventName::BufferAppend => decode_audio(data).map(ClientEvent::Append),
            EventName::BufferCommit => Ok(ClientEvent::Commit),
            EventName::BufferEnd => Ok(ClientEvent::End),
            EventName::Summarize => Ok(ClientEvent::Summarize),
        }
    }
}

/// `buffer.append` payloads: `{"audio": "<base64>"}` or a bare base64 string.
fn decode_audio(data: &Value) -> RelayResult<Bytes> {
    let invalid = |reason: String| RelayError::InvalidPayload {
        event: EventName::BufferAppend.as_str(),
        reason,
    };

    let encoded = match data {
        Value::String(encoded) => encoded.as_str(),
        Value::Object(fields) => fields
            .get("audio")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing string field 'audio'".to_string()))?,
        _ => return Err(invalid("expected an object with an 'audio' field".to_string())),
    };

    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| invalid(format!("audio is not valid base64: {}", e)))
}

/// Raw inbound text frame before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Per-event acknowledgment: `{ ok, error? }` plus context for the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    /// Echo of the event name as the client sent it.
    pub event: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
}

impl Ack {
    pub fn success(event: impl Into<String>, state: SessionState) -> Self {
        Self {
            event: event.into(),
            ok: true,
            error: None,
            message: None,
            state: Some(state),
        }
    }

    pub fn failure(event: impl Into<String>, error: &RelayError) -> Self {
        Self {
            event: event.into(),
            ok: false,
            error: Some(error.kind()),
            message: Some(error.to_string()),
            state: None,
        }
    }
}

/// Messages the server pushes to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once, right after the session is registered.
    Connected { connection_id: ConnectionId },

    Ack(Ack),

    /// Transcription of a committed utterance.
    Transcript {
        utterance: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    Summary { text: String },

    /// Asynchronous failure not tied to an ack (e.g. downstream failure).
    Error { code: ErrorKind, message: String },

    Ping { timestamp: u64 },

    Pong { timestamp: u64 },
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
