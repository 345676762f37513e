//! Agent HTTP routes.
//!
//! User calls must be signed by the agent's own key or a locally registered
//! client key. Pushes must be signed by the recorded coordinator. A rejected
//! caller never changes any state.

use axum::{
    Extension, Json, Router,
    extract::State,
    middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use tether_common::constants::services;
use tether_common::{
    Ack, CatalogDelta, CatalogInfo, CatalogRequest, ClientData, EndpointData, EndpointEntry,
    EndpointsUpRequest, EpDelta, KeyId, NodeId, Ping, TetherError, WlDelta,
};

use super::AgentState;
use crate::routes::{self, ApiResult, health::{HealthResponse, health}};
use crate::rpc::paths;
use crate::signing::{SignedBy, require_signature};

/// Create the agent router
pub fn agent_router(state: AgentState) -> Router {
    let signed = Router::new()
        .route(paths::REGISTER_ENDPOINT, post(register_endpoint))
        .route(paths::REGISTER_CLIENT, post(register_client))
        .route(paths::CATALOG, post(catalog))
        .route(paths::ENDPOINTS_UP, post(endpoints_up))
        .route(paths::WL_UPDATE, post(wl_update))
        .route(paths::EP_UPDATE, post(ep_update))
        .route(paths::UPDATE_CATALOG, post(update_catalog))
        .route(paths::COORDINATOR_PING, post(coordinator_ping))
        .route_layer(middleware::from_fn_with_state(state.authority.clone(), require_signature));

    Router::new()
        .route(paths::HEALTH, get(health_check))
        .route(paths::PING, post(routes::ping))
        .merge(signed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AgentState>) -> Json<HealthResponse> {
    health(services::REEVE, state.fleet.last_state().await)
}

async fn register_endpoint(
    State(state): State<AgentState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(data): Json<EndpointData>,
) -> ApiResult<Ack> {
    state.ensure_local(&signer).await?;
    Ok(Json(state.register_endpoint(data).await?))
}

async fn register_client(
    State(state): State<AgentState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(data): Json<ClientData>,
) -> ApiResult<Ack> {
    state.ensure_local(&signer).await?;
    Ok(Json(state.register_client(data).await?))
}

/// The viewer named in a read request, checked against the signer
fn viewer(signer: &KeyId, nodeid: &str, keyid: &str) -> Result<NodeId, TetherError> {
    if !keyid.is_empty() && keyid != signer.to_string() {
        return Err(TetherError::Unauthenticated(format!(
            "request keyid {} was not the signer",
            keyid
        )));
    }
    nodeid.parse()
}

async fn catalog(
    State(state): State<AgentState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(req): Json<CatalogRequest>,
) -> ApiResult<Vec<CatalogInfo>> {
    state.ensure_local(&signer).await?;
    let viewer = viewer(&signer, &req.nodeid, &req.keyid)?;
    Ok(Json(state.fleet.catalog_for(&viewer).await?))
}

async fn endpoints_up(
    State(state): State<AgentState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(req): Json<EndpointsUpRequest>,
) -> ApiResult<Vec<EndpointEntry>> {
    state.ensure_local(&signer).await?;
    let viewer = viewer(&signer, &req.nodeid, &req.keyid)?;
    Ok(Json(state.fleet.endpoints_up(&viewer, req.limit).await?))
}

async fn wl_update(
    State(state): State<AgentState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(delta): Json<WlDelta>,
) -> ApiResult<Ack> {
    state.ensure_coordinator(&signer).await?;
    Ok(Json(state.apply_wl_update(&delta).await?))
}

async fn ep_update(
    State(state): State<AgentState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(delta): Json<EpDelta>,
) -> ApiResult<Ack> {
    state.ensure_coordinator(&signer).await?;
    Ok(Json(state.apply_ep_update(&delta).await?))
}

async fn update_catalog(
    State(state): State<AgentState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(delta): Json<CatalogDelta>,
) -> ApiResult<Ack> {
    state.ensure_coordinator(&signer).await?;
    Ok(Json(state.apply_catalog(delta).await?))
}

async fn coordinator_ping(
    State(state): State<AgentState>,
    Extension(SignedBy(signer)): Extension<SignedBy>,
    Json(ping): Json<Ping>,
) -> ApiResult<Ping> {
    state.ensure_coordinator(&signer).await?;
    routes::ping(Json(ping)).await
}
