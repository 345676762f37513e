//! Axum layer that rejects unsigned or badly signed requests.

use axum::{
    body::{Body, to_bytes},
    extract::{OriginalUri, Request, State},
    middleware::Next,
    response::Response,
};

use tether_common::constants::MAX_SIGNED_BODY_BYTES;
use tether_common::{KeyId, TetherError};

use super::SignatureAuthority;
use crate::routes::ApiError;

/// Identity of the verified signer, available to handlers as an extension
#[derive(Clone, Debug)]
pub struct SignedBy(pub KeyId);

/// Verify request signatures before the handler runs
pub async fn require_signature(
    State(authority): State<SignatureAuthority>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_SIGNED_BODY_BYTES)
        .await
        .map_err(|e| TetherError::InvalidArgument(format!("request body: {}", e)))?;

    let path = parts
        .extensions
        .get::<OriginalUri>()
        .map(|uri| uri.0.path().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let signer = authority
        .verify(parts.method.as_str(), &path, &parts.headers, &bytes)
        .await
        .inspect_err(|e| tracing::warn!(path = %path, error = %e, "🚫 Rejected signed request"))?;

    parts.extensions.insert(SignedBy(signer));
    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
