//! # Event Router
//!
//! Entry point for everything a connection does: connect, route one named
//! event, disconnect. The router validates the event, dispatches it to the
//! owning session through the registry, and starts the downstream call a
//! transition asks for on its own tokio task.
//!
//! ## Validation order:
//! 1. Event name (closed set, with aliases)
//! 2. Payload shape
//! 3. Session lookup
//!
//! Downstream results come back as [`DownstreamOutcome`]s. A result is only
//! applied to the session if the call is still outstanding there; calls
//! dropped by `buffer.end` or a disconnect complete, get logged and are then
//! ignored.

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::events::{ClientEvent, EventName, ServerMessage};
use crate::gateway::DownstreamGateway;
use crate::session::{
    ConnectionId, DownstreamRequest, SessionRegistry, SessionSnapshot, SessionState, Submission,
};
use crate::state::AppMetrics;

pub struct EventRouter {
    registry: Arc<SessionRegistry>,
    gateway: Arc<dyn DownstreamGateway>,
    metrics: Arc<RwLock<AppMetrics>>,
}

/// A successfully dispatched event.
#[derive(Debug)]
pub struct Dispatched {
    pub event: EventName,
    /// Session state after the transition.
    pub state: SessionState,
    /// Downstream call started by this event, if any.
    pub in_flight: Option<JoinHandle<DownstreamOutcome>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Transcript { utterance: u64, text: Option<String> },
    Summary { text: String },
    Failed { error: RelayError },
}

/// What happened to one downstream call.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamOutcome {
    pub connection_id: ConnectionId,
    pub call_id: u64,
    pub kind: OutcomeKind,
    /// False when the session had already ended or dropped the call.
    pub relied_on: bool,
}

impl DownstreamOutcome {
    /// Notification for the client, or `None` if nobody relies on the result.
    pub fn into_message(self) -> Option<ServerMessage> {
        if !self.relied_on {
            return None;
        }
        let message = match self.kind {
            OutcomeKind::Transcript { utterance, text } => {
                ServerMessage::Transcript { utterance, text }
            }
            OutcomeKind::Summary { text } => ServerMessage::Summary { text },
            OutcomeKind::Failed { error } => ServerMessage::Error {
                code: error.kind(),
                message: error.to_string(),
            },
        };
        Some(message)
    }
}

impl EventRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gateway: Arc<dyn DownstreamGateway>,
        metrics: Arc<RwLock<AppMetrics>>,
    ) -> Self {
        Self {
            registry,
            gateway,
            metrics,
        }
    }

    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    /// Register the session for a newly established connection.
    pub fn connect(&self, id: ConnectionId) -> RelayResult<SessionSnapshot> {
        match self.registry.register(id.clone()) {
            Ok(snapshot) => {
                self.metrics.write().record_connection_opened();
                info!(connection_id = %id, active = self.registry.len(), "Session registered");
                Ok(snapshot)
            }
            Err(err) => {
                self.metrics.write().record_connection_rejected();
                warn!(connection_id = %id, "Connection rejected: {}", err);
                Err(err)
            }
        }
    }

    /// Destroy the session. Safe to call more than once.
    pub fn disconnect(&self, id: &ConnectionId) -> Option<SessionSnapshot> {
        let removed = self.registry.remove(id)?;
        self.metrics.write().record_connection_closed();

        if removed.outstanding_calls > 0 {
            info!(
                connection_id = %id,
                abandoned = removed.outstanding_calls,
                "Disconnected with downstream calls in flight; their results will be ignored"
            );
        }
        info!(
            connection_id = %id,
            state = %removed.state,
            utterances = removed.utterances_committed,
            "Session removed"
        );
        Some(removed)
    }

    /// Validate and dispatch one raw `(name, payload)` event.
    pub fn route(&self, id: &ConnectionId, name: &str, data: &Value) -> RelayResult<Dispatched> {
        let event = ClientEvent::parse(name, data).map_err(|err| self.rejected(id, name, err))?;
        self.route_event(id, event)
    }

    /// Dispatch an already validated event.
    pub fn route_event(&self, id: &ConnectionId, event: ClientEvent) -> RelayResult<Dispatched> {
        let name = event.name();
        let transition = self
            .registry
            .with_session(id, |session| session.apply(event))
            .and_then(|applied| applied)
            .map_err(|err| self.rejected(id, name.as_str(), err))?;

        self.metrics.write().record_event(name);
        debug!(connection_id = %id, event = %name, state = %transition.state, "Event routed");

        if transition.abandoned_calls > 0 {
            info!(
                connection_id = %id,
                abandoned = transition.abandoned_calls,
                "Session ended with downstream calls in flight"
            );
        }

        let in_flight = transition
            .submission
            .map(|submission| self.spawn_call(id.clone(), submission));

        Ok(Dispatched {
            event: name,
            state: transition.state,
            in_flight,
        })
    }

    /// Close stalled Buffering sessions.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let swept = self.registry.sweep_idle(max_idle, Utc::now());
        if !swept.is_empty() {
            self.metrics.write().record_swept(swept.len());
            for id in &swept {
                info!(connection_id = %id, idle_secs = max_idle.num_seconds(), "Idle session closed");
            }
        }
        swept
    }

    fn rejected(&self, id: &ConnectionId, name: &str, err: RelayError) -> RelayError {
        self.metrics.write().record_event_error(err.kind());
        debug!(connection_id = %id, event = name, error = %err.kind(), "Event rejected: {}", err);
        err
    }

    fn spawn_call(
        &self,
        connection_id: ConnectionId,
        submission: Submission,
    ) -> JoinHandle<DownstreamOutcome> {
        let registry = self.registry.clone();
        let gateway = self.gateway.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let Submission { call_id, request } = submission;

            let kind = match request {
                DownstreamRequest::Audio { utterance, audio } => {
                    debug!(connection_id = %connection_id, call_id, utterance, bytes = audio.len(), "Submitting audio");
                    match gateway.submit_audio(&connection_id, utterance, audio).await {
                        Ok(receipt) => OutcomeKind::Transcript {
                            utterance,
                            text: receipt.transcript,
                        },
                        Err(err) => OutcomeKind::Failed { error: err.into() },
                    }
                }
                DownstreamRequest::Summary { transcript } => {
                    debug!(connection_id = %connection_id, call_id, "Requesting summary");
                    match gateway
                        .submit_summary_request(&connection_id, &transcript)
                        .await
                    {
                        Ok(receipt) => OutcomeKind::Summary {
                            text: receipt.summary,
                        },
                        Err(err) => OutcomeKind::Failed { error: err.into() },
                    }
                }
            };

            let result = match &kind {
                OutcomeKind::Transcript { text, .. } => Ok(text.as_deref()),
                OutcomeKind::Summary { .. } => Ok(None),
                OutcomeKind::Failed { error } => Err(error),
            };
            let relied_on = registry
                .with_session(&connection_id, |session| session.complete_call(call_id, result))
                .unwrap_or(false);

            let succeeded = !matches!(kind, OutcomeKind::Failed { .. });
            metrics.write().record_downstream(succeeded, relied_on);

            match (&kind, relied_on) {
                (_, false) => {
                    info!(connection_id = %connection_id, call_id, "Downstream result discarded; session no longer relies on it");
                }
                (OutcomeKind::Failed { error }, true) => {
                    warn!(connection_id = %connection_id, call_id, gateway = gateway.name(), "Downstream call failed: {}", error);
                }
                _ => {
                    debug!(connection_id = %connection_id, call_id, "Downstream call completed");
                }
            }

            DownstreamOutcome {
                connection_id,
                call_id,
                kind,
                relied_on,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::gateway::testing::{RecordedCall, RecordingGateway};
    use crate::gateway::LoggingGateway;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::Notify;

    struct Harness {
        router: EventRouter,
        registry: Arc<SessionRegistry>,
        gateway: Arc<RecordingGateway>,
        metrics: Arc<RwLock<AppMetrics>>,
    }

    fn harness(gateway: RecordingGateway) -> Harness {
        let registry = Arc::new(SessionRegistry::new(10));
        let gateway = Arc::new(gateway);
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let router = EventRouter::new(registry.clone(), gateway.clone(), metrics.clone());
        Harness {
            router,
            registry,
            gateway,
            metrics,
        }
    }

    fn audio(chunk: &[u8]) -> Value {
        json!({ "audio": STANDARD.encode(chunk) })
    }

    fn id(raw: &str) -> ConnectionId {
        ConnectionId::from(raw)
    }

    /// Yield until the gated gateway has received `count` calls, so every
    /// one of them is parked on the gate in submission order.
    async fn wait_for_calls(gateway: &RecordingGateway, count: usize) {
        while gateway.calls().len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[actix_web::test]
    async fn test_append_append_commit_submits_concatenated_audio() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("c1")).unwrap();

        h.router.route(&id("c1"), "buffer.append", &audio(b"AA")).unwrap();
        h.router.route(&id("c1"), "buffer.append", &audio(b"BB")).unwrap();
        let dispatched = h.router.route(&id("c1"), "buffer.commit", &Value::Null).unwrap();
        assert_eq!(dispatched.state, SessionState::Committed);

        let outcome = dispatched.in_flight.unwrap().await.unwrap();
        assert!(outcome.relied_on);
        assert_eq!(
            h.gateway.calls(),
            vec![RecordedCall::Audio {
                session_id: id("c1"),
                utterance: 0,
                audio: Bytes::from_static(b"AABB"),
            }]
        );
        assert_eq!(
            h.registry.lookup(&id("c1")).unwrap().state,
            SessionState::Committed
        );
    }

    #[actix_web::test]
    async fn test_commit_before_append_is_out_of_order() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("c2")).unwrap();

        let err = h.router.route(&id("c2"), "buffer.commit", &Value::Null).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfOrderEvent);
        assert_eq!(h.registry.lookup(&id("c2")).unwrap().state, SessionState::Idle);
        assert!(h.gateway.calls().is_empty());
    }

    #[actix_web::test]
    async fn test_append_after_end_is_rejected() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("c3")).unwrap();

        h.router.route(&id("c3"), "buffer.append", &audio(b"AA")).unwrap();
        let dispatched = h.router.route(&id("c3"), "buffer.end", &Value::Null).unwrap();
        assert_eq!(dispatched.state, SessionState::Closed);

        let err = h.router.route(&id("c3"), "buffer.append", &audio(b"BB")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[actix_web::test]
    async fn test_unknown_event_checked_before_connection() {
        let h = harness(RecordingGateway::new());

        let err = h.router.route(&id("c4"), "unknown.type", &json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownEvent);

        let err = h.router.route(&id("c4"), "buffer.commit", &json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownConnection);
    }

    #[actix_web::test]
    async fn test_invalid_payload_checked_before_connection() {
        let h = harness(RecordingGateway::new());
        let err = h
            .router
            .route(&id("c5"), "buffer.append", &json!({ "audio": 5 }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPayload);
    }

    #[actix_web::test]
    async fn test_duplicate_connect_rejected() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("c1")).unwrap();
        let err = h.router.connect(id("c1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateConnection);

        let metrics = h.metrics.read();
        assert_eq!(metrics.connections_opened, 1);
        assert_eq!(metrics.connections_rejected, 1);
    }

    #[actix_web::test]
    async fn test_disconnect_twice() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("c1")).unwrap();

        assert!(h.router.disconnect(&id("c1")).is_some());
        assert!(h.router.disconnect(&id("c1")).is_none());
        assert!(h.registry.is_empty());
        assert_eq!(h.metrics.read().connections_closed, 1);
    }

    #[actix_web::test]
    async fn test_downstream_failure_leaves_session_committed() {
        let h = harness(RecordingGateway::failing());
        h.router.connect(id("c1")).unwrap();
        h.router.route(&id("c1"), "buffer.append", &audio(b"AA")).unwrap();

        let dispatched = h.router.route(&id("c1"), "buffer.commit", &Value::Null).unwrap();
        let outcome = dispatched.in_flight.unwrap().await.unwrap();

        assert!(outcome.relied_on);
        assert!(matches!(outcome.kind, OutcomeKind::Failed { .. }));
        let snapshot = h.registry.lookup(&id("c1")).unwrap();
        assert_eq!(snapshot.state, SessionState::Committed);
        assert_eq!(snapshot.downstream_failures, 1);
        assert_eq!(h.metrics.read().downstream_failed, 1);

        match outcome.into_message() {
            Some(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, ErrorKind::DownstreamFailure)
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[actix_web::test]
    async fn test_result_after_end_is_discarded() {
        let gate = Arc::new(Notify::new());
        let h = harness(RecordingGateway::gated(gate.clone()));
        h.router.connect(id("c1")).unwrap();
        h.router.route(&id("c1"), "buffer.append", &audio(b"AA")).unwrap();

        let commit = h.router.route(&id("c1"), "buffer.commit", &Value::Null).unwrap();
        let end = h.router.route(&id("c1"), "buffer.end", &Value::Null).unwrap();
        assert_eq!(end.state, SessionState::Closed);

        gate.notify_one();
        let outcome = commit.in_flight.unwrap().await.unwrap();
        assert!(!outcome.relied_on);
        assert_eq!(outcome.clone().into_message(), None);
        assert_eq!(h.registry.lookup(&id("c1")).unwrap().transcript_segments, 0);
        assert_eq!(h.metrics.read().downstream_discarded, 1);
    }

    #[actix_web::test]
    async fn test_result_after_disconnect_is_discarded() {
        let gate = Arc::new(Notify::new());
        let h = harness(RecordingGateway::gated(gate.clone()));
        h.router.connect(id("c1")).unwrap();
        h.router.route(&id("c1"), "buffer.append", &audio(b"AA")).unwrap();
        let commit = h.router.route(&id("c1"), "buffer.commit", &Value::Null).unwrap();

        let removed = h.router.disconnect(&id("c1")).unwrap();
        assert_eq!(removed.outstanding_calls, 1);

        gate.notify_one();
        let outcome = commit.in_flight.unwrap().await.unwrap();
        assert!(!outcome.relied_on);
    }

    #[actix_web::test]
    async fn test_late_result_never_lands_in_reconnected_session() {
        let gate = Arc::new(Notify::new());
        let h = harness(RecordingGateway::gated(gate.clone()));

        h.router.connect(id("c1")).unwrap();
        h.router.route(&id("c1"), "buffer.append", &audio(b"OLD")).unwrap();
        let old = h.router.route(&id("c1"), "buffer.commit", &Value::Null).unwrap();
        wait_for_calls(&h.gateway, 1).await;
        h.router.disconnect(&id("c1")).unwrap();

        // Same connection id, fresh session, its own call in flight.
        h.router.connect(id("c1")).unwrap();
        h.router.route(&id("c1"), "buffer.append", &audio(b"NEW")).unwrap();
        let new = h.router.route(&id("c1"), "buffer.commit", &Value::Null).unwrap();
        wait_for_calls(&h.gateway, 2).await;

        gate.notify_one();
        let old = old.in_flight.unwrap().await.unwrap();
        assert!(!old.relied_on);
        assert_eq!(old.clone().into_message(), None);

        let snapshot = h.registry.lookup(&id("c1")).unwrap();
        assert_eq!(snapshot.transcript_segments, 0);
        assert_eq!(snapshot.outstanding_calls, 1);

        gate.notify_one();
        let new = new.in_flight.unwrap().await.unwrap();
        assert!(new.relied_on);
        assert_ne!(old.call_id, new.call_id);

        let snapshot = h.registry.lookup(&id("c1")).unwrap();
        assert_eq!(snapshot.transcript_segments, 1);
        assert_eq!(snapshot.outstanding_calls, 0);
        assert_eq!(h.metrics.read().downstream_discarded, 1);
        assert_eq!(h.metrics.read().downstream_succeeded, 1);
    }

    #[actix_web::test]
    async fn test_summarize_needs_transcript_text() {
        let registry = Arc::new(SessionRegistry::new(10));
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let router = EventRouter::new(registry.clone(), Arc::new(LoggingGateway), metrics.clone());
        router.connect(id("c1")).unwrap();

        router.route(&id("c1"), "buffer.append", &audio(b"AA")).unwrap();
        let commit = router.route(&id("c1"), "buffer.commit", &Value::Null).unwrap();
        let outcome = commit.in_flight.unwrap().await.unwrap();
        assert_eq!(
            outcome.kind,
            OutcomeKind::Transcript {
                utterance: 0,
                text: None
            }
        );

        let err = router.route(&id("c1"), "summarize", &Value::Null).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NothingToSummarize);
        assert_eq!(registry.lookup(&id("c1")).unwrap().outstanding_calls, 0);
        assert_eq!(metrics.read().event_errors["nothing_to_summarize"], 1);
    }

    #[actix_web::test]
    async fn test_conversation_envelope_routes_buffer_events() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("c1")).unwrap();

        let append = h
            .router
            .route(
                &id("c1"),
                "openai:conversation",
                &json!({ "type": "input_audio_buffer.append", "audio": "QUE=" }),
            )
            .unwrap();
        assert_eq!(append.event, EventName::BufferAppend);
        assert_eq!(append.state, SessionState::Buffering);

        let err = h
            .router
            .route(&id("c1"), "openai:conversation", &json!({ "type": "bogus" }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownEvent);
        assert_eq!(h.registry.lookup(&id("c1")).unwrap().state, SessionState::Buffering);

        let commit = h
            .router
            .route(
                &id("c1"),
                "openai:conversation",
                &json!({ "type": "input_audio_buffer.commit" }),
            )
            .unwrap();
        assert_eq!(commit.state, SessionState::Committed);
        commit.in_flight.unwrap().await.unwrap();
        assert_eq!(
            h.gateway.calls(),
            vec![RecordedCall::Audio {
                session_id: id("c1"),
                utterance: 0,
                audio: Bytes::from_static(b"AA"),
            }]
        );
        assert_eq!(h.metrics.read().events_routed["buffer.commit"], 1);
    }

    #[actix_web::test]
    async fn test_summarize_forwards_transcript() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("c1")).unwrap();

        let err = h.router.route(&id("c1"), "summarize", &Value::Null).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NothingToSummarize);

        for chunk in [&b"AAAA"[..], &b"BB"[..]] {
            h.router.route(&id("c1"), "buffer.append", &audio(chunk)).unwrap();
            let commit = h.router.route(&id("c1"), "buffer.commit", &Value::Null).unwrap();
            commit.in_flight.unwrap().await.unwrap();
        }

        let summarize = h.router.route(&id("c1"), "sonju:summarize", &Value::Null).unwrap();
        assert_eq!(summarize.event, EventName::Summarize);
        assert_eq!(summarize.state, SessionState::Committed);

        let outcome = summarize.in_flight.unwrap().await.unwrap();
        let transcript = "utterance 0 (4 bytes) utterance 1 (2 bytes)";
        assert_eq!(
            outcome.kind,
            OutcomeKind::Summary {
                text: format!("summary of: {}", transcript)
            }
        );
        assert_eq!(
            h.gateway.calls().last(),
            Some(&RecordedCall::Summary {
                session_id: id("c1"),
                transcript: transcript.to_string(),
            })
        );
    }

    #[actix_web::test]
    async fn test_sessions_are_independent() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("a")).unwrap();
        h.router.connect(id("b")).unwrap();

        h.router.route(&id("a"), "buffer.append", &audio(b"A1")).unwrap();
        h.router.route(&id("b"), "buffer.append", &audio(b"B1")).unwrap();
        h.router.route(&id("a"), "buffer.append", &audio(b"A2")).unwrap();
        h.router.route(&id("b"), "buffer.end", &Value::Null).unwrap();

        let a = h.router.route(&id("a"), "buffer.commit", &Value::Null).unwrap();
        a.in_flight.unwrap().await.unwrap();

        assert_eq!(
            h.gateway.calls(),
            vec![RecordedCall::Audio {
                session_id: id("a"),
                utterance: 0,
                audio: Bytes::from_static(b"A1A2"),
            }]
        );
        assert_eq!(h.registry.lookup(&id("b")).unwrap().state, SessionState::Closed);
    }

    #[actix_web::test]
    async fn test_event_metrics() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("c1")).unwrap();
        h.router.route(&id("c1"), "buffer.append", &audio(b"AA")).unwrap();
        let _ = h.router.route(&id("c1"), "bogus", &Value::Null);
        let _ = h.router.route(&id("c1"), "summarize", &Value::Null);

        let metrics = h.metrics.read();
        assert_eq!(metrics.events_routed["buffer.append"], 1);
        assert_eq!(metrics.event_errors["unknown_event"], 1);
        assert_eq!(metrics.event_errors["nothing_to_summarize"], 1);
    }

    #[actix_web::test]
    async fn test_sweep_closes_stalled_sessions() {
        let h = harness(RecordingGateway::new());
        h.router.connect(id("idle")).unwrap();
        h.router.connect(id("busy")).unwrap();
        h.router.route(&id("busy"), "buffer.append", &audio(b"AA")).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let swept = h.router.sweep_idle(Duration::zero());
        assert_eq!(swept, vec![id("busy")]);
        let busy = h.registry.lookup(&id("busy")).unwrap();
        assert_eq!(busy.state, SessionState::Closed);
        assert!(busy.expired);
        assert_eq!(h.registry.lookup(&id("idle")).unwrap().state, SessionState::Idle);
        assert_eq!(h.metrics.read().sessions_swept, 1);
    }
}
