use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use utoipa::OpenApi;
use uuid::Uuid;

use super::{
    dto::{HistoryParams, PairRequest, DEFAULT_HISTORY_DAYS},
    errors::AppError,
};
use crate::{
    alerts::{AlertRecord, AlertRule, Severity},
    db::models::{OptimalRange, Quantity, Reading, Sensor},
    engine::{Engine, SensorStatus, SensorView, TickReport},
    history::{downsample, RETENTION_DAYS},
    power::PowerPhase,
    registry::{SensorConfig, SensorPatch},
};

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

/// Every registered sensor joined with its power state and newest reading.
#[utoipa::path(
    get,
    path = "/sensors",
    responses(
        (status = 200, description = "Sensors with current data", body = Vec<SensorView>),
    ),
    tag = "sensors"
)]
pub async fn list_sensors(State(engine): State<Arc<Engine>>) -> Json<Vec<SensorView>> {
    Json(engine.list_sensors_with_current_data().await)
}

/// Register a new, unpaired sensor.
#[utoipa::path(
    post,
    path = "/sensors",
    request_body = SensorConfig,
    responses(
        (status = 201, description = "Sensor registered under a temporary id", body = Sensor),
        (status = 422, description = "Invalid configuration"),
        (status = 503, description = "Registered, but the durable write failed"),
    ),
    tag = "sensors"
)]
pub async fn create_sensor(
    State(engine): State<Arc<Engine>>,
    Json(config): Json<SensorConfig>,
) -> Result<(StatusCode, Json<Sensor>), AppError> {
    let sensor = engine.add_sensor(config).await?;
    Ok((StatusCode::CREATED, Json(sensor)))
}

#[utoipa::path(
    get,
    path = "/sensors/{id}",
    params(("id" = String, Path, description = "Permanent or temporary sensor id")),
    responses(
        (status = 200, description = "Sensor record", body = Sensor),
        (status = 404, description = "Unknown sensor"),
    ),
    tag = "sensors"
)]
pub async fn get_sensor(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<Sensor>, AppError> {
    Ok(Json(engine.get_sensor(&id).await?))
}

/// Pair a sensor, moving it from its temporary to a permanent id.
#[utoipa::path(
    post,
    path = "/sensors/{temp_id}/pair",
    params(("temp_id" = String, Path, description = "Temporary sensor id, e.g. TEMP-001")),
    request_body = PairRequest,
    responses(
        (status = 200, description = "Paired sensor", body = Sensor),
        (status = 404, description = "Unknown temporary id"),
        (status = 409, description = "Sensor already paired"),
    ),
    tag = "sensors"
)]
pub async fn pair_sensor(
    State(engine): State<Arc<Engine>>,
    Path(temp_id): Path<String>,
    Json(req): Json<PairRequest>,
) -> Result<Json<Sensor>, AppError> {
    Ok(Json(engine.pair_sensor(&temp_id, &req.pairing_code).await?))
}

#[utoipa::path(
    patch,
    path = "/sensors/{id}",
    params(("id" = String, Path, description = "Sensor id")),
    request_body = SensorPatch,
    responses(
        (status = 200, description = "Updated sensor", body = Sensor),
        (status = 404, description = "Unknown sensor"),
        (status = 422, description = "Invalid configuration"),
    ),
    tag = "sensors"
)]
pub async fn update_sensor(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(patch): Json<SensorPatch>,
) -> Result<Json<Sensor>, AppError> {
    Ok(Json(engine.update_config(&id, patch).await?))
}

/// Delete a sensor and everything recorded for it.
#[utoipa::path(
    delete,
    path = "/sensors/{id}",
    params(("id" = String, Path, description = "Sensor id")),
    responses(
        (status = 204, description = "Sensor deleted"),
        (status = 404, description = "Unknown sensor"),
    ),
    tag = "sensors"
)]
pub async fn delete_sensor(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    engine.delete_sensor(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Readings of the last `days` days in ascending order, optionally
/// downsampled to `points` for charting. Unknown sensors yield `[]`.
#[utoipa::path(
    get,
    path = "/sensors/{id}/history",
    params(
        ("id" = String, Path, description = "Sensor id"),
        ("days" = Option<i64>, Query, description = "Look-back in days (1..=30, default 7)"),
        ("points" = Option<usize>, Query, description = "Maximum number of points"),
    ),
    responses(
        (status = 200, description = "Readings", body = Vec<Reading>),
    ),
    tag = "sensors"
)]
pub async fn get_history(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<Reading>> {
    let days = params.days.unwrap_or(DEFAULT_HISTORY_DAYS).clamp(1, RETENTION_DAYS);
    let series = engine.get_history(&id, days).await;
    Json(match params.points {
        Some(n) => downsample(&series, n),
        None => series,
    })
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/alerts",
    responses(
        (status = 200, description = "Live alerts with resolution status", body = Vec<AlertRecord>),
    ),
    tag = "alerts"
)]
pub async fn list_alerts(State(engine): State<Arc<Engine>>) -> Json<Vec<AlertRecord>> {
    Json(engine.get_alerts().await)
}

#[utoipa::path(
    post,
    path = "/alerts/{id}/resolve",
    params(("id" = Uuid, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Resolved alert", body = AlertRecord),
        (status = 404, description = "No live alert with this id"),
    ),
    tag = "alerts"
)]
pub async fn resolve_alert(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AlertRecord>, AppError> {
    Ok(Json(engine.resolve_alert(id).await?))
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Run a generation pass now, independent of the scheduled timer.
#[utoipa::path(
    post,
    path = "/simulation/generate",
    responses(
        (status = 200, description = "Pass summary", body = TickReport),
    ),
    tag = "simulation"
)]
pub async fn generate_now(State(engine): State<Arc<Engine>>) -> Json<TickReport> {
    Json(engine.generate_now().await)
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        list_sensors, create_sensor, get_sensor, pair_sensor, update_sensor, delete_sensor,
        get_history, list_alerts, resolve_alert, generate_now, health
    ),
    components(schemas(
        Sensor, SensorView, SensorStatus, SensorConfig, SensorPatch, PairRequest, Reading,
        Quantity, OptimalRange, PowerPhase, AlertRecord, AlertRule, Severity, TickReport
    )),
    tags(
        (name = "sensors",    description = "Sensor registry and history"),
        (name = "alerts",     description = "Threshold alerts"),
        (name = "simulation", description = "Telemetry generation"),
        (name = "system",     description = "System endpoints"),
    ),
    info(
        title = "Farm Telemetry API",
        version = "0.1.0",
        description = "Simulated farm-sensor telemetry and alerting"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
