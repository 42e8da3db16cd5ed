use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::EngineError;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<EngineError>() {
            Some(EngineError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(EngineError::AlreadyPaired(_)) => StatusCode::CONFLICT,
            Some(EngineError::InvalidConfig(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Some(EngineError::Persistence(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Some(EngineError::CorruptState { .. }) | None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::sensor_not_found("SENS-001"), StatusCode::NOT_FOUND),
            (EngineError::AlreadyPaired("TEMP-001".into()), StatusCode::CONFLICT),
            (EngineError::InvalidConfig("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
        assert_eq!(
            AppError(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
