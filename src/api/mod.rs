pub mod dto;
pub mod errors;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use handlers::ApiDoc;

use crate::engine::Engine;

pub fn router(engine: Arc<Engine>) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route(
            "/sensors",
            get(handlers::list_sensors).post(handlers::create_sensor),
        )
        .route(
            "/sensors/{id}",
            get(handlers::get_sensor)
                .patch(handlers::update_sensor)
                .delete(handlers::delete_sensor),
        )
        .route("/sensors/{temp_id}/pair", post(handlers::pair_sensor))
        .route("/sensors/{id}/history", get(handlers::get_history))
        .route("/alerts", get(handlers::list_alerts))
        .route("/alerts/{id}/resolve", post(handlers::resolve_alert))
        .route("/simulation/generate", post(handlers::generate_now))
        .with_state(engine)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
