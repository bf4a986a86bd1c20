//! # Sonju Relay - Main Application Entry Point
//!
//! Real-time audio-streaming session router. Every WebSocket connection gets
//! one session; the relay buffers the audio chunks it streams, hands each
//! committed utterance to a downstream transcription/summarization service
//! and pushes the results back over the socket.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, `config.toml`, environment)
//! - **error**: Relay error taxonomy and HTTP error responses
//! - **events**: Wire vocabulary for the WebSocket protocol
//! - **session**: Session state machine, audio buffer and registry
//! - **router**: Event routing and downstream call tracking
//! - **gateway**: Downstream service clients
//! - **state**: Shared application state and metrics
//! - **websocket**: One actor per client connection
//! - **health** / **handlers**: HTTP endpoints

mod config;
mod error;
mod events;
mod gateway;
mod handlers;
mod health;
mod router;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting sonju-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = AppState::from_config(config.clone())?;
    info!(
        gateway = app_state.router.gateway_name(),
        max_sessions = config.sessions.max_concurrent_sessions,
        "Downstream gateway ready"
    );

    spawn_idle_sweeper(app_state.clone());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::relay_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; defaults to `sonju_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sonju_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Periodically close Buffering sessions that stopped sending events.
///
/// Settings are re-read every round, so runtime config updates apply without
/// a restart. `idle_timeout_secs = 0` skips the sweep.
fn spawn_idle_sweeper(state: AppState) {
    tokio::spawn(async move {
        loop {
            let interval = state.get_config().sessions.sweep_interval_secs.max(1);
            tokio::time::sleep(Duration::from_secs(interval)).await;

            let idle_timeout_secs = state.get_config().sessions.idle_timeout_secs;
            if idle_timeout_secs == 0 {
                continue;
            }

            let Some(max_idle) = i64::try_from(idle_timeout_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
            else {
                warn!(idle_timeout_secs, "Idle timeout out of range, skipping sweep");
                continue;
            };
            let swept = state.router.sweep_idle(max_idle);
            debug!(swept = swept.len(), "Idle sweep finished");
        }
    });
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn wait_for_shutdown() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
