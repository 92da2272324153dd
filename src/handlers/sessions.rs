//! Read-only registry views plus forced shutdown of a single call.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.sessions.snapshots();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max_sessions": state.sessions.max_sessions(),
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let handle = state
        .sessions
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Session {} not found", id)))?;

    Ok(HttpResponse::Ok().json(handle.snapshot()))
}

/// Ask one session to tear down. Returns 202: teardown finishes in the
/// background within the grace period.
pub async fn shutdown_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    if !state.sessions.shutdown(&id) {
        return Err(AppError::NotFound(format!("Session {} not found", id)));
    }

    Ok(HttpResponse::Accepted().json(json!({
        "status": "shutdown_requested",
        "session_id": id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
