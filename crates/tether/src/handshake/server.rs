use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{info, warn};

use tether_common::{
    EncryptedCallback, HandshakeState, NetId, NodeId, Ping, Pingu, PubKey, RegisterStatus,
    TetherError, ack_timestamp,
};

use super::CoordinatorIdentity;
use crate::flock::FlockKey;
use crate::routes::{self, ApiError};
use crate::rpc::{SignedClient, paths};
use crate::signing::{Whitelist, verifying_key};

/// Durable record of the agents the handshake admitted
pub trait AdmissionLedger: Send + Sync {
    fn admit(&self, nodeid: &NodeId, netid: &NetId, pubkey: &PubKey) -> Result<(), TetherError>;
}

/// Coordinator side of the handshake
#[derive(Clone)]
pub struct HandshakeServer {
    flock: FlockKey,
    identity: Arc<CoordinatorIdentity>,
    callback: SignedClient,
    whitelist: Whitelist,
    ledger: Arc<dyn AdmissionLedger>,
    reeve_timeout: Duration,
    callback_retry: Duration,
}

/// A decrypted and validated join request
struct Joiner {
    nodeid: NodeId,
    netid: NetId,
    pubkey: PubKey,
}

impl HandshakeServer {
    pub fn new(
        flock: FlockKey,
        identity: CoordinatorIdentity,
        callback: SignedClient,
        whitelist: Whitelist,
        ledger: Arc<dyn AdmissionLedger>,
        reeve_timeout: Duration,
        callback_retry: Duration,
    ) -> Self {
        Self {
            flock,
            identity: Arc::new(identity),
            callback,
            whitelist,
            ledger,
            reeve_timeout,
            callback_retry,
        }
    }

    fn open(&self, sealed: &EncryptedCallback) -> Result<Joiner, TetherError> {
        let nodeid: NodeId = self.flock.open_text(&sealed.nodeid_enc)?.parse()?;
        let netid: NetId = self.flock.open_text(&sealed.netid_enc)?.parse()?;
        if netid.query {
            return Err(TetherError::InvalidArgument(format!("netid {} is a query", netid)));
        }
        let pubkey = PubKey::from_json(&self.flock.open_text(&sealed.pubkey_enc)?)?;
        verifying_key(&pubkey)?;
        Ok(Joiner {
            nodeid,
            netid,
            pubkey,
        })
    }

    fn frame(&self, status: HandshakeState, error: Option<String>) -> String {
        let frame = RegisterStatus {
            status,
            ts: ack_timestamp(),
            nodeid: self.identity.nodeid.clone(),
            netid: self.identity.netid.clone(),
            pubkey: self.identity.pubkey.clone(),
            error,
        };
        let mut line = serde_json::to_string(&frame).unwrap_or_default();
        line.push('\n');
        line
    }

    /// One signed round trip to the joining agent
    async fn call_back(&self, netid: &NetId) -> Result<(), TetherError> {
        let reply: Ping = self
            .callback
            .post(&netid.http_url(), paths::COORDINATOR_PING, &Ping { value: Pingu::Test })
            .await?;
        match reply.value {
            Pingu::Pong => Ok(()),
            other => Err(TetherError::InvalidArgument(format!("callback answered {:?}", other))),
        }
    }

    /// Retry the callback every `callback_retry` until `reeve_timeout`
    async fn verify_joiner(&self, netid: &NetId) -> Result<(), TetherError> {
        let deadline = Instant::now() + self.reeve_timeout;
        loop {
            match self.call_back(netid).await {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() + self.callback_retry >= deadline => return Err(e),
                Err(e) => {
                    tracing::debug!(netid = %netid, error = %e, "Callback failed, retrying");
                    tokio::time::sleep(self.callback_retry).await;
                }
            }
        }
    }

    /// Record the joiner, then trust its key
    async fn admit(&self, joiner: &Joiner) -> Result<(), TetherError> {
        let ledger = self.ledger.clone();
        let (nodeid, netid, pubkey) = (joiner.nodeid.clone(), joiner.netid.clone(), joiner.pubkey.clone());
        tokio::task::spawn_blocking(move || ledger.admit(&nodeid, &netid, &pubkey))
            .await
            .map_err(|e| TetherError::Internal(format!("admission task: {}", e)))??;
        self.whitelist.add(&joiner.pubkey).await.map(|_| ())
    }

    async fn run(self, joiner: Joiner, frames: mpsc::Sender<String>) {
        if frames.send(self.frame(HandshakeState::Busy, None)).await.is_err() {
            warn!(netid = %joiner.netid, "Joining agent went away before BUSY");
            return;
        }

        let result = match self.verify_joiner(&joiner.netid).await {
            Ok(()) => self.admit(&joiner).await,
            Err(e) => Err(e),
        };

        let last = match result {
            Ok(()) => {
                info!(nodeid = %joiner.nodeid, netid = %joiner.netid, "🤝 Agent registered");
                self.frame(HandshakeState::Done, None)
            }
            Err(e) => {
                warn!(nodeid = %joiner.nodeid, netid = %joiner.netid, error = %e, "Agent callback failed");
                self.frame(HandshakeState::Error, Some(e.to_string()))
            }
        };
        let _ = frames.send(last).await;
    }
}

async fn register(
    State(server): State<HandshakeServer>,
    Json(sealed): Json<EncryptedCallback>,
) -> Result<Response, ApiError> {
    let joiner = server.open(&sealed).inspect_err(|e| {
        warn!(error = %e, "Rejected registration payload");
    })?;

    let (tx, rx) = mpsc::channel::<String>(4);
    tokio::spawn(server.run(joiner, tx));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

/// Router for the registry listener
pub fn registry_router(server: HandshakeServer) -> Router {
    Router::new()
        .route(paths::PING, post(routes::ping))
        .route(paths::REGISTER, post(register))
        .with_state(server)
}
