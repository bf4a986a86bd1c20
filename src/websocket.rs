//! # WebSocket Relay Handler
//!
//! Clients connect to `/ws`. Each connection is one actix actor and owns
//! exactly one relay session for its lifetime.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server registers a session and greets the client
//!    with `{"type":"connected","connection_id":...}`
//! 2. **Events**: text frames `{"type": <event name>, "data": <payload>}`;
//!    every event is answered with an `ack`
//! 3. **Audio shorthand**: a binary frame is a `buffer.append` of its bytes
//! 4. **Results**: transcripts, summaries and downstream failures arrive
//!    later as their own messages
//! 5. **Expiry**: a session closed by the idle sweep is reported once with
//!    `{"type":"error","code":"session_closed"}` on the next heartbeat
//! 6. **Disconnect**: closing the socket destroys the session
//!
//! Frames from one connection are handled one at a time, in arrival order.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::Bytes;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, RelayResult};
use crate::events::{Ack, ClientEvent, InboundEvent, ServerMessage};
use crate::router::{Dispatched, DownstreamOutcome};
use crate::session::{ConnectionId, SessionRegistry};
use crate::state::AppState;

/// A decoded text frame.
#[derive(Debug, PartialEq)]
enum Inbound {
    Event { name: String, data: Value },
    /// Application-level ping; answered with a pong carrying `timestamp`.
    Ping { timestamp: Option<u64> },
    Pong,
    Malformed(String),
}

fn decode_text(text: &str) -> Inbound {
    match serde_json::from_str::<InboundEvent>(text) {
        Ok(event) => match event.event_type.as_str() {
            "ping" => Inbound::Ping {
                timestamp: event.data.get("timestamp").and_then(Value::as_u64),
            },
            "pong" => Inbound::Pong,
            _ => Inbound::Event {
                name: event.event_type,
                data: event.data,
            },
        },
        Err(err) => Inbound::Malformed(err.to_string()),
    }
}

/// Turn a routing result into the ack for the client.
fn acknowledge(
    label: &str,
    result: RelayResult<Dispatched>,
) -> (ServerMessage, Option<JoinHandle<DownstreamOutcome>>) {
    match result {
        Ok(dispatched) => (
            ServerMessage::Ack(Ack::success(label, dispatched.state)),
            dispatched.in_flight,
        ),
        Err(err) => (ServerMessage::Ack(Ack::failure(label, &err)), None),
    }
}

/// Error to push when the idle sweep has expired this connection's session.
fn expiry_notice(registry: &SessionRegistry, id: &ConnectionId) -> Option<ServerMessage> {
    let snapshot = registry.lookup(id)?;
    snapshot.expired.then(|| ServerMessage::Error {
        code: ErrorKind::SessionClosed,
        message: format!("session '{}' expired after inactivity", id),
    })
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// WebSocket actor for one relay connection.
pub struct RelayWebSocket {
    connection_id: ConnectionId,
    state: AppState,

    /// Set once the session is registered; only then does `stopped` remove it.
    registered: bool,

    /// The client has been told its session expired.
    expiry_reported: bool,

    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

/// Result of a downstream call, delivered back to the owning actor.
#[derive(Message)]
#[rtype(result = "()")]
struct DeliverOutcome(DownstreamOutcome);

impl RelayWebSocket {
    pub fn new(state: AppState) -> Self {
        let websocket = state.get_config().websocket;
        Self {
            connection_id: ConnectionId::generate(),
            state,
            registered: false,
            expiry_reported: false,
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(websocket.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(websocket.client_timeout_secs),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match message.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => error!(connection_id = %self.connection_id, "Failed to serialize message: {}", err),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: ErrorKind, message: String) {
        self.send(ctx, &ServerMessage::Error { code, message });
    }

    /// Ack the event and hand any downstream call to a watcher task.
    fn reply(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        label: &str,
        result: RelayResult<Dispatched>,
    ) {
        let (ack, in_flight) = acknowledge(label, result);
        self.send(ctx, &ack);

        if let Some(handle) = in_flight {
            let addr = ctx.address();
            let connection_id = self.connection_id.clone();
            tokio::spawn(async move {
                match handle.await {
                    Ok(outcome) => addr.do_send(DeliverOutcome(outcome)),
                    Err(err) => {
                        error!(connection_id = %connection_id, "Downstream task failed: {}", err)
                    }
                }
            });
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match decode_text(text) {
            Inbound::Event { name, data } => {
                let result = self.state.router.route(&self.connection_id, &name, &data);
                self.reply(ctx, &name, result);
            }
            Inbound::Ping { timestamp } => {
                let timestamp = timestamp.unwrap_or_else(now_millis);
                self.send(ctx, &ServerMessage::Pong { timestamp });
            }
            Inbound::Pong => {}
            Inbound::Malformed(reason) => {
                debug!(connection_id = %self.connection_id, "Malformed frame: {}", reason);
                self.send_error(ctx, ErrorKind::InvalidPayload, format!("Invalid JSON: {}", reason));
            }
        }
    }

    fn handle_audio(&mut self, data: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        let event = ClientEvent::Append(data);
        let label = event.name().as_str();
        let result = self.state.router.route_event(&self.connection_id, event);
        self.reply(ctx, label, result);
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(connection_id = %act.connection_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
            act.send(ctx, &ServerMessage::Ping { timestamp: now_millis() });

            if !act.expiry_reported {
                if let Some(notice) = expiry_notice(&act.state.registry, &act.connection_id) {
                    info!(connection_id = %act.connection_id, "Reporting idle expiry to client");
                    act.expiry_reported = true;
                    act.send(ctx, &notice);
                }
            }
        });
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        match self.state.router.connect(self.connection_id.clone()) {
            Ok(_) => {
                self.registered = true;
                self.send(
                    ctx,
                    &ServerMessage::Connected {
                        connection_id: self.connection_id.clone(),
                    },
                );
                self.start_heartbeat(ctx);
            }
            Err(err) => {
                self.send_error(ctx, err.kind(), err.to_string());
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Again,
                    description: Some(err.kind().to_string()),
                }));
                ctx.stop();
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if self.registered {
            self.state.router.disconnect(&self.connection_id);
        }
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => self.handle_audio(data, ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<DeliverOutcome> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: DeliverOutcome, ctx: &mut Self::Context) {
        if let Some(message) = msg.0.into_message() {
            self.send(ctx, &message);
        }
    }
}

/// WebSocket endpoint handler: upgrades the request and starts the actor.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());
    ws::start(RelayWebSocket::new(app_state.get_ref().clone()), &req, stream)
}
