//! HTTP plumbing shared by the coordinator and agent servers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use tether_common::{Ping, Pingu, TetherError};

pub mod health;

/// Error body returned by every Tether endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Handler error carrying a `TetherError` class onto the wire
#[derive(Debug)]
pub struct ApiError(pub TetherError);

impl From<TetherError> for ApiError {
    fn from(err: TetherError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TetherError>() {
            Ok(inner) => Self(inner),
            Err(other) => Self(TetherError::Internal(format!("{:#}", other))),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            TetherError::InvalidArgument(m)
            | TetherError::Unauthenticated(m)
            | TetherError::FailedPrecondition(m)
            | TetherError::NotFound(m)
            | TetherError::Unavailable(m)
            | TetherError::Timeout(m) => m.clone(),
            other => other.to_string(),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Unsigned liveness check
pub async fn ping(Json(ping): Json<Ping>) -> ApiResult<Ping> {
    match ping.value {
        Pingu::Ping | Pingu::Test => Ok(Json(Ping { value: Pingu::Pong })),
        Pingu::Pong => Err(TetherError::InvalidArgument("pong is a reply".into()).into()),
    }
}
