use serde::Deserialize;
use utoipa::ToSchema;

/// Default look-back for `GET /sensors/{id}/history`.
pub const DEFAULT_HISTORY_DAYS: i64 = 7;

/// Request body for `POST /sensors/{temp_id}/pair`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PairRequest {
    /// Code read from the device label, e.g. a QR payload.
    pub pairing_code: String,
}

/// Query parameters for `GET /sensors/{id}/history`.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    /// Look-back window in days (1..=30). Defaults to 7.
    pub days: Option<i64>,
    /// Downsample to at most this many points.
    pub points: Option<usize>,
}
