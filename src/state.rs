//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Sharing pattern:
//! - **`Arc<RwLock<T>>`** for data that changes at runtime (config, metrics)
//! - **`Arc<T>`** for components with their own interior locking (the
//!   session registry and the event router)
//!
//! Locks come from `parking_lot`, so there is no poisoning to unwrap.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::error::ErrorKind;
use crate::events::EventName;
use crate::gateway::{self, DownstreamGateway};
use crate::router::EventRouter;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Relay counters, shared with the event router
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub registry: Arc<SessionRegistry>,

    pub router: Arc<EventRouter>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since server start.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub connections_opened: u64,
    pub connections_closed: u64,

    /// Connections turned away (duplicate id, session limit).
    pub connections_rejected: u64,

    /// Successfully routed events, keyed by event name.
    pub events_routed: HashMap<String, u64>,

    /// Rejected events, keyed by error kind.
    pub event_errors: HashMap<String, u64>,

    pub downstream_succeeded: u64,
    pub downstream_failed: u64,

    /// Results that arrived after their session had ended.
    pub downstream_discarded: u64,

    pub sessions_swept: u64,
}

impl AppMetrics {
    pub fn record_connection_opened(&mut self) {
        self.connections_opened += 1;
    }

    pub fn record_connection_rejected(&mut self) {
        self.connections_rejected += 1;
    }

    pub fn record_connection_closed(&mut self) {
        self.connections_closed += 1;
    }

    pub fn record_event(&mut self, event: EventName) {
        *self
            .events_routed
            .entry(event.as_str().to_string())
            .or_default() += 1;
    }

    pub fn record_event_error(&mut self, kind: ErrorKind) {
        *self.event_errors.entry(kind.as_str().to_string()).or_default() += 1;
    }

    /// Record a finished downstream call. `relied_on` is false when the
    /// result was dropped because the session ended first.
    pub fn record_downstream(&mut self, succeeded: bool, relied_on: bool) {
        if !relied_on {
            self.downstream_discarded += 1;
        } else if succeeded {
            self.downstream_succeeded += 1;
        } else {
            self.downstream_failed += 1;
        }
    }

    pub fn record_swept(&mut self, count: usize) {
        self.sessions_swept += count as u64;
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_opened.saturating_sub(self.connections_closed)
    }

    pub fn total_events(&self) -> u64 {
        self.events_routed.values().sum::<u64>() + self.event_errors.values().sum::<u64>()
    }

    /// Share of routed events that were rejected (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        let total = self.total_events();
        if total > 0 {
            self.event_errors.values().sum::<u64>() as f64 / total as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig, gateway: Arc<dyn DownstreamGateway>) -> Self {
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let registry = Arc::new(SessionRegistry::new(
            config.sessions.max_concurrent_sessions,
        ));
        let router = Arc::new(EventRouter::new(
            registry.clone(),
            gateway,
            metrics.clone(),
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics,
            registry,
            router,
            start_time: Instant::now(),
        }
    }

    /// Build the state with the gateway selected in `config`.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let gateway = gateway::build(&config.gateway)?;
        Ok(Self::new(config, gateway))
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// The session limit takes effect immediately. Existing sessions above a
    /// lowered limit are kept; only new connections are refused.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.registry
            .set_max_sessions(new_config.sessions.max_concurrent_sessions);
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
