//! Liveness, version and metrics endpoints.
//!
//! None of these touch the engine pool: `/health` must answer even while every
//! slot is busy with a long transcription.

use actix_web::{http::header, web, HttpResponse};
use serde_json::json;
use tracing::error;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// `GET /health`
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let server = &state.config.server;
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "version": server.version,
        "env": server.env,
    }))
}

/// `GET /version`
pub async fn version(state: web::Data<AppState>) -> HttpResponse {
    let server = &state.config.server;
    HttpResponse::Ok().json(json!({
        "name": server.name,
        "version": server.version,
    }))
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    // Reading the permit count does not wait on or reserve a slot.
    state
        .metrics
        .set_slots_available(state.pipeline.arbiter().available());

    let body = state.metrics.render().map_err(|err| {
        error!("Failed to encode metrics: {}", err);
        AppError::Internal(format!("metrics encoding failed: {}", err))
    })?;

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, state.metrics.content_type()))
        .body(body))
}
