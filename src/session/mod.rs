//! # Conversation Sessions
//!
//! One session exists per live client connection. It owns the audio buffer
//! for the utterance currently being spoken and the transcript collected so
//! far. All state changes go through [`Session::apply`].
//!
//! ## Session Lifecycle:
//! 1. **Idle**: Session registered, no audio received yet
//! 2. **Buffering**: Audio chunks are being appended
//! 3. **Committed**: Utterance frozen and handed to the downstream service
//! 4. **Closed**: Buffer released, every further event is rejected
//!
//! A committed session goes back to Buffering when the next utterance starts.

pub mod buffer;
pub mod registry;
pub mod state;

pub use buffer::AudioBuffer;
pub use registry::{RegistrySummary, SessionRegistry};
pub use state::{
    CallKind, DownstreamRequest, Session, SessionSnapshot, Submission, Transition,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one transport connection.
///
/// The WebSocket layer generates a fresh UUID per connection. Tests and
/// tools may use any string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a random identifier for a new connection.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Where a session is in its audio-buffer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Buffering,
    Committed,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Buffering => "buffering",
            SessionState::Committed => "committed",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
