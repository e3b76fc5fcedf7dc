//! Liveness probe with a database round trip.

use std::time::Instant;

use axum::{Json, extract::State};
use axum_service_kit::error::AppError;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub database_latency_ms: u64,
    pub pool_size: u32,
    pub idle_connections: usize,
    pub checked_at: DateTime<Utc>,
}

/// `GET /health`. Public; a failed ping renders as `HEALTH__DATABASE` with 500.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthReport>, AppError> {
    let started = Instant::now();
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|error| AppError::new("HEALTH__DATABASE", AppError::from(error)))?;

    Ok(Json(HealthReport {
        status: "ok",
        database_latency_ms: started.elapsed().as_millis() as u64,
        pool_size: state.pool.size(),
        idle_connections: state.pool.num_idle(),
        checked_at: Utc::now(),
    }))
}
