//! # Configuration Management
//!
//! Loads application configuration from several sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `APP_` prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (set by most deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_GATEWAY__BASE_URL`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (the `Default` impl)
//!
//! Nested keys use a double underscore, because several field names contain a
//! single one (`APP_SESSIONS__MAX_CONCURRENT_SESSIONS=50`).

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Upper bound for every second-valued setting (one week).
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub gateway: GatewayConfig,
    pub websocket: WebSocketConfig,
}

/// Address the HTTP/WebSocket server binds to.
///
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any interface (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Session capacity and the stalled-session policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Maximum number of simultaneously connected sessions.
    pub max_concurrent_sessions: usize,

    /// Close a Buffering session after this many seconds without events.
    /// `0` disables the sweep.
    pub idle_timeout_secs: u64,

    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
}

/// Which downstream backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    /// Log submissions only.
    Log,
    /// JSON over HTTP to `base_url`.
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub kind: GatewayKind,
    #[serde(default)]
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

/// Heartbeat settings for client connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// How often the server pings the client.
    pub heartbeat_interval_secs: u64,
    /// Close the connection after this long without any client traffic.
    pub client_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            kind: GatewayKind::Log,
            base_url: None,
            timeout_ms: 10_000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            sessions: SessionsConfig {
                max_concurrent_sessions: 100,
                idle_timeout_secs: 300,
                sweep_interval_secs: 30,
            },
            gateway: GatewayConfig::default(),
            websocket: WebSocketConfig {
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_GATEWAY__KIND=http`: Use the HTTP backend
    /// - `APP_GATEWAY__BASE_URL=http://stt:8000`: Backend location
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.sessions.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }

        for (name, secs) in [
            ("Idle timeout", self.sessions.idle_timeout_secs),
            ("Sweep interval", self.sessions.sweep_interval_secs),
            ("Heartbeat interval", self.websocket.heartbeat_interval_secs),
            ("Client timeout", self.websocket.client_timeout_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(anyhow!(
                    "{} cannot exceed {} seconds (got {})",
                    name,
                    MAX_INTERVAL_SECS,
                    secs
                ));
            }
        }

        if self.sessions.idle_timeout_secs > 0 && self.sessions.sweep_interval_secs == 0 {
            return Err(anyhow!(
                "Sweep interval must be greater than 0 when idle timeout is enabled"
            ));
        }

        if self.gateway.timeout_ms == 0 {
            return Err(anyhow!("Gateway timeout must be greater than 0"));
        }

        if self.gateway.kind == GatewayKind::Http
            && self.gateway.base_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(anyhow!("Gateway base_url is required when kind = \"http\""));
        }

        if self.websocket.heartbeat_interval_secs == 0 {
            return Err(anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.websocket.client_timeout_secs <= self.websocket.heartbeat_interval_secs {
            return Err(anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        Ok(())
    }

    /// Apply a partial update such as `{"sessions": {"idle_timeout_secs": 60}}`.
    ///
    /// Only the fields present in the JSON change. The result is validated
    /// before it is accepted, and `self` is untouched on error. The bind
    /// address is fixed once the server is listening, so `server` is rejected.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if partial.get("server").is_some() {
            return Err(anyhow!(
                "Server host and port can only be changed with a restart"
            ));
        }

        if let Some(sessions) = partial.get("sessions") {
            if let Some(max) = sessions.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                updated.sessions.max_concurrent_sessions = max as usize;
            }
            if let Some(idle) = sessions.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                updated.sessions.idle_timeout_secs = idle;
            }
            if let Some(interval) = sessions.get("sweep_interval_secs").and_then(|v| v.as_u64()) {
                updated.sessions.sweep_interval_secs = interval;
            }
        }

        if let Some(gateway) = partial.get("gateway") {
            if let Some(timeout) = gateway.get("timeout_ms").and_then(|v| v.as_u64()) {
                updated.gateway.timeout_ms = timeout;
            }
            if gateway.get("kind").is_some() || gateway.get("base_url").is_some() {
                return Err(anyhow!(
                    "Gateway kind and base_url can only be changed with a restart"
                ));
            }
        }

        if let Some(websocket) = partial.get("websocket") {
            if let Some(interval) = websocket.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                updated.websocket.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = websocket.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                updated.websocket.client_timeout_secs = timeout;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
