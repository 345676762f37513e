//! Steward HTTP routes.

use axum::{
    Extension, Json, Router,
    extract::State,
    middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use tether_common::constants::services;
use tether_common::ids::local_uuid;
use tether_common::{Ack, AckStatus, ClientData, EndpointData, RuleInfo, RuleRemoval, TetherError};

use super::StewardState;
use super::ingest::IngestReceipt;
use crate::routes::{self, ApiError, ApiResult, health::{HealthResponse, health}};
use crate::rpc::paths;
use crate::signing::{SignedBy, require_signature};

/// Create the Steward router
pub fn steward_router(state: StewardState) -> Router {
    let signed = Router::new()
        .route(paths::CLIENT_UPDATE, post(client_update))
        .route(paths::ENDPOINT_UPDATE, post(endpoint_update))
        .route(paths::ADMIN_RULES, get(list_rules).post(add_rule).delete(remove_rule))
        .route_layer(middleware::from_fn_with_state(state.authority.clone(), require_signature));

    Router::new()
        .route(paths::HEALTH, get(health_check))
        .route(paths::PING, post(routes::ping))
        .merge(signed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<StewardState>) -> Json<HealthResponse> {
    health(services::STEWARD, state.ingest.current_state())
}

fn accepted(receipt: IngestReceipt, local: &str) -> Json<Ack> {
    let mut ack = Ack::new(AckStatus::Done);
    ack.remoteuuid = receipt.tx_uuid;
    ack.localuuid = local_uuid(local).to_string();
    ack.state = receipt.state;
    Json(ack)
}

async fn client_update(
    State(state): State<StewardState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(data): Json<ClientData>,
) -> ApiResult<Ack> {
    let local = data.keyid.clone();
    let receipt = state.ingest.ingest_client(data, signer)?;
    Ok(accepted(receipt, &local))
}

async fn endpoint_update(
    State(state): State<StewardState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(data): Json<EndpointData>,
) -> ApiResult<Ack> {
    let local = data.netid.clone();
    let receipt = state.ingest.ingest_endpoint(data, signer)?;
    Ok(accepted(receipt, &local))
}

fn ensure_admin(state: &StewardState, signer: &tether_common::KeyId) -> Result<(), ApiError> {
    if signer.principal != state.admin_principal {
        return Err(TetherError::Unauthenticated(format!(
            "{} may not administer rules",
            signer
        ))
        .into());
    }
    Ok(())
}

async fn list_rules(
    State(state): State<StewardState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
) -> ApiResult<Vec<RuleInfo>> {
    ensure_admin(&state, &signer)?;
    Ok(Json(state.db.rules()?))
}

async fn add_rule(
    State(state): State<StewardState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(rule): Json<RuleInfo>,
) -> ApiResult<Vec<RuleInfo>> {
    ensure_admin(&state, &signer)?;
    for (what, value) in [("horde", &rule.horde), ("from", &rule.from), ("to", &rule.to)] {
        if value.is_empty() {
            return Err(TetherError::InvalidArgument(format!("rule {} is empty", what)).into());
        }
    }
    state.add_rule(&rule).await?;
    Ok(Json(state.db.rules()?))
}

async fn remove_rule(
    State(state): State<StewardState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(removal): Json<RuleRemoval>,
) -> ApiResult<Vec<RuleInfo>> {
    ensure_admin(&state, &signer)?;
    state.remove_rule(&removal.rule, &removal.horde).await?;
    Ok(Json(state.db.rules()?))
}
