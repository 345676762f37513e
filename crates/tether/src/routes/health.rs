//! Health check responses.

use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
    /// Current StateClock on a coordinator, last applied delta state on an agent
    pub state: i64,
}

pub fn health(service: &str, state: i64) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: service.to_string(),
        state,
    })
}
