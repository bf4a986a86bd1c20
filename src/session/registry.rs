//! # Session Registry
//!
//! Sole owner of every [`Session`]. Sessions are keyed by connection id and
//! each one sits behind its own mutex, so work on one connection never waits
//! on another. The map lock is held only to insert, remove or clone out a
//! session handle, never during a dispatch.
//!
//! Callers outside this module only ever see [`SessionSnapshot`]s.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{ConnectionId, Session, SessionSnapshot, SessionState};
use crate::error::{RelayError, RelayResult};

/// Tracks one session per active connection.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Arc<Mutex<Session>>>>,

    /// Can be changed at runtime through the config endpoint.
    max_sessions: AtomicUsize,
}

/// Aggregate view used by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub state_counts: HashMap<SessionState, usize>,
    pub buffered_bytes: usize,
    pub outstanding_calls: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: AtomicUsize::new(max_sessions),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::Relaxed)
    }

    pub fn set_max_sessions(&self, max_sessions: usize) {
        self.max_sessions.store(max_sessions, Ordering::Relaxed);
    }

    /// Create an Idle session for a newly established connection.
    pub fn register(&self, id: ConnectionId) -> RelayResult<SessionSnapshot> {
        let mut sessions = self.sessions.write();

        if sessions.contains_key(&id) {
            return Err(RelayError::DuplicateConnection(id));
        }

        let max_sessions = self.max_sessions();
        if sessions.len() >= max_sessions {
            return Err(RelayError::SessionLimitReached(max_sessions));
        }

        let session = Session::new(id.clone());
        let snapshot = session.snapshot();
        sessions.insert(id, Arc::new(Mutex::new(session)));
        Ok(snapshot)
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<SessionSnapshot> {
        self.handle(id).map(|session| session.lock().snapshot())
    }

    /// Drop a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<SessionSnapshot> {
        let removed = self.sessions.write().remove(id);
        removed.map(|session| session.lock().snapshot())
    }

    /// Run `f` against the session while holding only that session's lock.
    pub fn with_session<R>(
        &self,
        id: &ConnectionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> RelayResult<R> {
        let session = self
            .handle(id)
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))?;
        let mut guard = session.lock();
        Ok(f(&mut guard))
    }

    fn handle(&self, id: &ConnectionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut snapshots: Vec<_> = handles
            .iter()
            .map(|session| session.lock().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    /// Expire Buffering sessions that have seen no event since `now - max_idle`.
    ///
    /// Expired sessions stay registered as Closed until their connection goes
    /// away; later events on them fail with `SessionClosed`. A `max_idle` so
    /// large that the cutoff falls outside the representable range sweeps
    /// nothing.
    pub fn sweep_idle(&self, max_idle: Duration, now: DateTime<Utc>) -> Vec<ConnectionId> {
        let Some(cutoff) = now.checked_sub_signed(max_idle) else {
            return Vec::new();
        };
        let handles: Vec<_> = self.sessions.read().values().cloned().collect();

        handles
            .into_iter()
            .filter_map(|handle| {
                let mut session = handle.lock();
                let stalled = session.state() == SessionState::Buffering
                    && session.last_activity() < cutoff;
                if stalled && session.expire().is_ok() {
                    Some(session.id().clone())
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn summary(&self) -> RegistrySummary {
        let snapshots = self.snapshots();
        let mut state_counts = HashMap::new();
        let mut buffered_bytes = 0;
        let mut outstanding_calls = 0;

        for snapshot in &snapshots {
            *state_counts.entry(snapshot.state).or_insert(0) += 1;
            buffered_bytes += snapshot.buffered_bytes;
            outstanding_calls += snapshot.outstanding_calls;
        }

        RegistrySummary {
            total_sessions: snapshots.len(),
            max_sessions: self.max_sessions(),
            state_counts,
            buffered_bytes,
            outstanding_calls,
        }
    }
}
