use crate::session::{RegistrySummary, SessionState};
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let sessions = state.registry.summary();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "gateway": {
            "kind": config.gateway.kind,
            "name": state.router.gateway_name()
        },
        "sessions": session_counts(&sessions),
        "metrics": {
            "total_events": metrics.total_events(),
            "error_rate": metrics.error_rate(),
            "active_connections": metrics.active_connections()
        },
        "system": get_system_status(&sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let sessions = state.registry.summary();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "connections": {
            "opened": metrics.connections_opened,
            "closed": metrics.connections_closed,
            "rejected": metrics.connections_rejected,
            "active": metrics.active_connections()
        },
        "events": {
            "routed": metrics.events_routed,
            "errors": metrics.event_errors,
            "error_rate": metrics.error_rate(),
            "events_per_second": events_per_second(&metrics, uptime_seconds)
        },
        "downstream": {
            "succeeded": metrics.downstream_succeeded,
            "failed": metrics.downstream_failed,
            "discarded": metrics.downstream_discarded,
            "outstanding": sessions.outstanding_calls
        },
        "sessions": {
            "counts": session_counts(&sessions),
            "buffered_bytes": sessions.buffered_bytes,
            "swept": metrics.sessions_swept
        }
    }))
}

fn events_per_second(metrics: &AppMetrics, uptime_seconds: u64) -> f64 {
    if uptime_seconds > 0 {
        metrics.total_events() as f64 / uptime_seconds as f64
    } else {
        0.0
    }
}

/// Per-state counts, always listing every state.
fn session_counts(sessions: &RegistrySummary) -> serde_json::Value {
    let count = |state: SessionState| sessions.state_counts.get(&state).copied().unwrap_or(0);
    json!({
        "total": sessions.total_sessions,
        "max": sessions.max_sessions,
        "idle": count(SessionState::Idle),
        "buffering": count(SessionState::Buffering),
        "committed": count(SessionState::Committed),
        "closed": count(SessionState::Closed)
    })
}

fn get_system_status(sessions: &RegistrySummary) -> serde_json::Value {
    let session_usage = if sessions.max_sessions > 0 {
        sessions.total_sessions as f64 / sessions.max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
