use thiserror::Error;

use crate::db::StoreError;

/// Errors surfaced by the telemetry engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("sensor {0} is already paired")]
    AlreadyPaired(String),

    #[error("invalid sensor configuration: {0}")]
    InvalidConfig(String),

    /// The durable write failed. In-memory state already reflects the change
    /// and the write is queued for retry.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// Internal per-sensor inconsistency. Only ever logged by the tick loop.
    #[error("corrupt state for sensor {sensor_id}: {reason}")]
    CorruptState { sensor_id: String, reason: String },
}

impl EngineError {
    pub fn sensor_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { what: "sensor", id: id.into() }
    }

    pub fn alert_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { what: "alert", id: id.into() }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
