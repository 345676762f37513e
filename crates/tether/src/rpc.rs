//! Outbound RPC: signed HTTP calls and the role capability traits.
//!
//! The coordinator talks to agents through `AgentApi` and agents talk to the
//! coordinator through `CoordinatorApi`. Production uses the HTTP
//! implementations below; tests substitute in-memory fakes.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use tether_common::constants::headers;
use tether_common::{
    Ack, CatalogDelta, ClientData, EndpointData, EpDelta, NetId, Ping, Pingu, TetherError, WlDelta,
};

use crate::handshake::CoordinatorSlot;
use crate::routes::ErrorBody;
use crate::signing::SignerApi;

/// HTTP paths served by the registry, steward and agent listeners
pub mod paths {
    pub const PING: &str = "/ping";
    pub const HEALTH: &str = "/health";
    pub const REGISTER: &str = "/register";

    pub const CLIENT_UPDATE: &str = "/client-update";
    pub const ENDPOINT_UPDATE: &str = "/endpoint-update";
    pub const ADMIN_RULES: &str = "/admin/rules";

    pub const REGISTER_ENDPOINT: &str = "/register-endpoint";
    pub const REGISTER_CLIENT: &str = "/register-client";
    pub const CATALOG: &str = "/catalog";
    pub const ENDPOINTS_UP: &str = "/endpoints-up";
    pub const WL_UPDATE: &str = "/wl-update";
    pub const EP_UPDATE: &str = "/ep-update";
    pub const UPDATE_CATALOG: &str = "/update-catalog";
    pub const COORDINATOR_PING: &str = "/coordinator-ping";
}

fn transport_error(err: reqwest::Error) -> TetherError {
    if err.is_timeout() {
        TetherError::Timeout(err.to_string())
    } else {
        TetherError::Unavailable(err.to_string())
    }
}

/// Rebuild the error class of a non-2xx response
pub(crate) async fn error_from_response(resp: reqwest::Response) -> TetherError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    TetherError::from_status(status, message)
}

async fn decode_response<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, TetherError> {
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    resp.json::<R>()
        .await
        .map_err(|e| TetherError::Internal(format!("bad response body: {}", e)))
}

/// Build the HTTP client used for all outbound calls
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, TetherError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TetherError::Config(format!("http client: {}", e)))
}

/// Unsigned JSON POST
pub async fn post_json<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
    http: &reqwest::Client,
    base_url: &str,
    path: &str,
    body: &Req,
) -> Result<Resp, TetherError> {
    let resp = http
        .post(format!("{}{}", base_url, path))
        .json(body)
        .send()
        .await
        .map_err(transport_error)?;
    decode_response(resp).await
}

/// Ping `base_url` every `delay` until it answers or `timeout` passes
pub async fn ping_sleep(
    http: &reqwest::Client,
    base_url: &str,
    delay: Duration,
    timeout: Duration,
) -> Result<(), TetherError> {
    let deadline = Instant::now() + timeout;
    loop {
        match post_json::<_, Ping>(http, base_url, paths::PING, &Ping { value: Pingu::Ping }).await {
            Ok(reply) if reply.value == Pingu::Pong => return Ok(()),
            Ok(reply) => tracing::debug!(?reply, "Unexpected ping reply"),
            Err(e) => tracing::debug!(url = base_url, error = %e, "Ping failed"),
        }
        if Instant::now() + delay > deadline {
            return Err(TetherError::Timeout(format!("no answer from {}", base_url)));
        }
        tokio::time::sleep(delay).await;
    }
}

/// HTTP client that signs every request with a service key
#[derive(Clone)]
pub struct SignedClient {
    http: reqwest::Client,
    signer: Arc<dyn SignerApi>,
}

impl SignedClient {
    pub fn new(http: reqwest::Client, signer: Arc<dyn SignerApi>) -> Self {
        Self { http, signer }
    }

    pub fn signer(&self) -> &Arc<dyn SignerApi> {
        &self.signer
    }

    pub async fn send<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        method: Method,
        base_url: &str,
        path: &str,
        body: &Req,
    ) -> Result<Resp, TetherError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| TetherError::Internal(format!("encode request: {}", e)))?;
        let signed = self.signer.sign_request(method.as_str(), path, &bytes);

        let resp = self
            .http
            .request(method, format!("{}{}", base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(headers::X_KEY_ID, signed.key_id)
            .header(headers::X_ALGORITHM, signed.algorithm)
            .header(headers::X_DATE, signed.date)
            .header(headers::X_SIGNATURE, signed.signature)
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;
        decode_response(resp).await
    }

    pub async fn post<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        base_url: &str,
        path: &str,
        body: &Req,
    ) -> Result<Resp, TetherError> {
        self.send(Method::POST, base_url, path, body).await
    }
}

/// Calls an agent makes on the coordinator
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn client_update(&self, data: &ClientData) -> Result<Ack, TetherError>;
    async fn endpoint_update(&self, data: &EndpointData) -> Result<Ack, TetherError>;
}

/// Calls the coordinator makes on an agent
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn wl_update(&self, reeve: &NetId, delta: &WlDelta) -> Result<Ack, TetherError>;
    async fn ep_update(&self, reeve: &NetId, delta: &EpDelta) -> Result<Ack, TetherError>;
    async fn update_catalog(&self, reeve: &NetId, delta: &CatalogDelta) -> Result<Ack, TetherError>;
}

/// `CoordinatorApi` over HTTP, addressed through the recorded coordinator identity
pub struct HttpCoordinator {
    client: SignedClient,
    slot: CoordinatorSlot,
}

impl HttpCoordinator {
    pub fn new(client: SignedClient, slot: CoordinatorSlot) -> Self {
        Self { client, slot }
    }

    async fn base_url(&self) -> Result<String, TetherError> {
        let identity = self
            .slot
            .get()
            .await
            .ok_or_else(|| TetherError::Unavailable("no coordinator recorded".into()))?;
        let netid: NetId = identity.netid.parse()?;
        Ok(netid.http_url())
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinator {
    async fn client_update(&self, data: &ClientData) -> Result<Ack, TetherError> {
        let url = self.base_url().await?;
        self.client.post(&url, paths::CLIENT_UPDATE, data).await
    }

    async fn endpoint_update(&self, data: &EndpointData) -> Result<Ack, TetherError> {
        let url = self.base_url().await?;
        self.client.post(&url, paths::ENDPOINT_UPDATE, data).await
    }
}

/// `AgentApi` over HTTP, dialing each Reeve at its NetID address
pub struct HttpAgents {
    client: SignedClient,
}

impl HttpAgents {
    pub fn new(client: SignedClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentApi for HttpAgents {
    async fn wl_update(&self, reeve: &NetId, delta: &WlDelta) -> Result<Ack, TetherError> {
        self.client.post(&reeve.http_url(), paths::WL_UPDATE, delta).await
    }

    async fn ep_update(&self, reeve: &NetId, delta: &EpDelta) -> Result<Ack, TetherError> {
        self.client.post(&reeve.http_url(), paths::EP_UPDATE, delta).await
    }

    async fn update_catalog(&self, reeve: &NetId, delta: &CatalogDelta) -> Result<Ack, TetherError> {
        self.client.post(&reeve.http_url(), paths::UPDATE_CATALOG, delta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_sleep_times_out_on_dead_address() {
        let http = http_client(Duration::from_millis(200)).unwrap();
        let started = std::time::Instant::now();
        let err = ping_sleep(
            &http,
            "http://127.0.0.1:9",
            Duration::from_millis(50),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TetherError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
