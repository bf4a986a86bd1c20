//! # Session State Machine
//!
//! ## Transitions:
//! | From              | Event         | To        |
//! |-------------------|---------------|-----------|
//! | Idle / Committed  | buffer.append | Buffering |
//! | Buffering         | buffer.append | Buffering |
//! | Buffering         | buffer.commit | Committed |
//! | any but Closed    | buffer.end    | Closed    |
//! | any but Closed    | summarize     | unchanged |
//!
//! Everything else is rejected without touching the session. Closed is
//! terminal: every event fails with `SessionClosed`.
//!
//! The machine itself never performs I/O. A transition that needs the
//! downstream service returns a [`Submission`], and the caller runs it. Each
//! submission gets a call id that stays *outstanding* until its result is
//! reported back through [`Session::complete_call`]. Ending the session
//! forgets every outstanding id, so late results are dropped. Call ids are
//! unique for the whole process, so a result can never be claimed by a later
//! session that reuses the same connection id.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{AudioBuffer, ConnectionId, SessionState};
use crate::error::{RelayError, RelayResult};
use crate::events::ClientEvent;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(0);

/// Which kind of downstream call an outstanding id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallKind {
    Transcription { utterance: u64 },
    Summary,
}

/// Work the caller must hand to the downstream gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamRequest {
    Audio { utterance: u64, audio: Bytes },
    Summary { transcript: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub call_id: u64,
    pub request: DownstreamRequest,
}

/// Result of a successful [`Session::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: SessionState,
    pub submission: Option<Submission>,
    /// Outstanding calls whose results will be ignored (only set by `buffer.end`).
    pub abandoned_calls: usize,
}

impl Transition {
    fn to(state: SessionState) -> Self {
        Self {
            state,
            submission: None,
            abandoned_calls: 0,
        }
    }
}

/// Server-side state for one active client connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    state: SessionState,
    buffer: AudioBuffer,
    utterances_committed: u64,
    /// Transcript text by utterance index, so late replies still join in commit order.
    transcript: BTreeMap<u64, String>,
    outstanding: HashMap<u64, CallKind>,
    /// Closed by the idle sweep rather than by the client.
    expired: bool,
    bytes_received: u64,
    chunks_received: u64,
    downstream_failures: u64,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// Read-only copy of a session, safe to hand out past one dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub state: SessionState,
    pub buffered_bytes: usize,
    pub buffered_chunks: usize,
    pub utterances_committed: u64,
    pub transcript_segments: usize,
    pub outstanding_calls: usize,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub downstream_failures: u64,
    pub expired: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(id: ConnectionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: SessionState::Idle,
            buffer: AudioBuffer::new(),
            utterances_committed: 0,
            transcript: BTreeMap::new(),
            outstanding: HashMap::new(),
            expired: false,
            bytes_received: 0,
            chunks_received: 0,
            downstream_failures: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffer(&self) -> &AudioBuffer {
        &self.buffer
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn outstanding_calls(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Close the session on behalf of the idle sweep.
    ///
    /// Same effect as `buffer.end`, but the session remembers it was expired
    /// so the transport can tell the client why.
    pub fn expire(&mut self) -> RelayResult<Transition> {
        if self.state.is_closed() {
            return Err(RelayError::SessionClosed(self.id.clone()));
        }
        let transition = self.end();
        self.expired = true;
        Ok(transition)
    }

    /// Apply one client event.
    ///
    /// On error the session is left exactly as it was.
    pub fn apply(&mut self, event: ClientEvent) -> RelayResult<Transition> {
        if self.state.is_closed() {
            return Err(RelayError::SessionClosed(self.id.clone()));
        }

        let transition = match event {
            ClientEvent::Append(chunk) => self.append(chunk),
            ClientEvent::Commit => self.commit()?,
            ClientEvent::End => self.end(),
            ClientEvent::Summarize => self.summarize()?,
        };

        self.last_activity = Utc::now();
        Ok(transition)
    }

    fn append(&mut self, chunk: Bytes) -> Transition {
        if self.state != SessionState::Buffering {
            // A new utterance starts with an empty buffer.
            self.buffer.clear();
            self.state = SessionState::Buffering;
        }

        self.bytes_received += chunk.len() as u64;
        self.chunks_received += 1;
        self.buffer.append(chunk);

        Transition::to(self.state)
    }

    fn commit(&mut self) -> RelayResult<Transition> {
        if self.state != SessionState::Buffering {
            return Err(RelayError::OutOfOrderEvent {
                event: ClientEvent::Commit.name().as_str(),
                state: self.state,
            });
        }

        let audio = self.buffer.freeze();
        let utterance = self.utterances_committed;
        self.utterances_committed += 1;
        self.state = SessionState::Committed;

        let call_id = self.track(CallKind::Transcription { utterance });
        Ok(Transition {
            state: self.state,
            submission: Some(Submission {
                call_id,
                request: DownstreamRequest::Audio { utterance, audio },
            }),
            abandoned_calls: 0,
        })
    }

    fn end(&mut self) -> Transition {
        self.buffer.clear();
        let abandoned = self.outstanding.len();
        self.outstanding.clear();
        self.state = SessionState::Closed;

        Transition {
            abandoned_calls: abandoned,
            ..Transition::to(self.state)
        }
    }

    fn summarize(&mut self) -> RelayResult<Transition> {
        // Needs transcript text, not just committed audio.
        let transcript = self.transcript_text();
        if transcript.is_empty() {
            return Err(RelayError::NothingToSummarize(self.id.clone()));
        }

        let call_id = self.track(CallKind::Summary);
        Ok(Transition {
            state: self.state,
            submission: Some(Submission {
                call_id,
                request: DownstreamRequest::Summary { transcript },
            }),
            abandoned_calls: 0,
        })
    }

    fn track(&mut self, kind: CallKind) -> u64 {
        let call_id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        self.outstanding.insert(call_id, kind);
        call_id
    }

    /// Report the outcome of a downstream call.
    ///
    /// Returns `false` when nothing relies on the call anymore (session
    /// ended, or the id was never issued). In that case the result is
    /// ignored. Failures never change the session state.
    pub fn complete_call(
        &mut self,
        call_id: u64,
        outcome: Result<Option<&str>, &RelayError>,
    ) -> bool {
        let Some(kind) = self.outstanding.remove(&call_id) else {
            return false;
        };

        match (kind, outcome) {
            (CallKind::Transcription { utterance }, Ok(Some(text))) => {
                self.transcript.insert(utterance, text.to_string());
            }
            (_, Ok(_)) => {}
            (_, Err(_)) => self.downstream_failures += 1,
        }
        true
    }

    /// Transcript segments joined in commit order.
    pub fn transcript_text(&self) -> String {
        self.transcript
            .values()
            .map(|segment| segment.trim())
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.id.clone(),
            state: self.state,
            buffered_bytes: self.buffer.len(),
            buffered_chunks: self.buffer.chunk_count(),
            utterances_committed: self.utterances_committed,
            transcript_segments: self.transcript.len(),
            outstanding_calls: self.outstanding.len(),
            bytes_received: self.bytes_received,
            chunks_received: self.chunks_received,
            downstream_failures: self.downstream_failures,
            expired: self.expired,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}
