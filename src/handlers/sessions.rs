//! Read-only views of the session registry.

use crate::{error::AppError, session::ConnectionId, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.registry.snapshots();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = ConnectionId::from(path.into_inner());
    let session = state
        .registry
        .lookup(&id)
        .ok_or_else(|| AppError::NotFound(format!("session '{}'", id)))?;

    Ok(HttpResponse::Ok().json(session))
}
