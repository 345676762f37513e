use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use tether_common::constants::REGISTER_RETRY_PAUSE_MS;
use tether_common::{
    EncryptedCallback, HandshakeState, NetId, NodeId, PubKey, RegisterStatus, TetherError,
};

use super::{CoordinatorIdentity, CoordinatorSlot};
use crate::flock::FlockKey;
use crate::rpc::{self, paths};
use crate::signing::{Whitelist, verifying_key};

/// Where and how long to try joining
#[derive(Debug, Clone)]
pub struct JoinSettings {
    pub registry_url: String,
    pub ping_delay: Duration,
    pub ping_timeout: Duration,
    pub register_timeout: Duration,
}

/// The identity an agent presents when joining
#[derive(Debug, Clone)]
pub struct JoinIdentity {
    pub nodeid: NodeId,
    pub netid: NetId,
    pub pubkey: PubKey,
}

/// Agent trust state touched by the handshake
struct Trust<'a> {
    whitelist: &'a Whitelist,
    slot: &'a CoordinatorSlot,
    installed: Option<CoordinatorIdentity>,
}

impl Trust<'_> {
    /// Install the coordinator key and identity on the first frame
    async fn accept(&mut self, frame: &RegisterStatus) -> Result<(), TetherError> {
        let pubkey = PubKey::from_json(&frame.pubkey)?;
        let (key_id, _) = verifying_key(&pubkey)?;
        if let Some(installed) = &self.installed {
            if installed.keyid != key_id.to_string() {
                return Err(TetherError::InvalidArgument(
                    "coordinator key changed mid-handshake".into(),
                ));
            }
            return Ok(());
        }

        let _: NodeId = frame.nodeid.parse()?;
        let netid: NetId = frame.netid.parse()?;
        if netid.query {
            return Err(TetherError::InvalidArgument(format!("coordinator netid {} is a query", netid)));
        }

        self.whitelist.add(&pubkey).await?;
        let identity = CoordinatorIdentity {
            nodeid: frame.nodeid.clone(),
            netid: frame.netid.clone(),
            keyid: key_id.to_string(),
            pubkey: frame.pubkey.clone(),
        };
        self.installed = Some(identity.clone());
        self.slot.set(identity).await
    }

    async fn rollback(&mut self) {
        if let Some(installed) = self.installed.take() {
            self.whitelist.remove(&installed.keyid).await;
            if let Err(e) = self.slot.clear().await {
                warn!(error = %e, "Failed to clear coordinator record");
            }
        }
    }
}

async fn read_frames(resp: reqwest::Response, trust: &mut Trust<'_>) -> Result<HandshakeState, TetherError> {
    let mut last = None;
    let mut buf: Vec<u8> = Vec::new();
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TetherError::Unavailable(format!("registration stream: {}", e)))?;
        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let frame: RegisterStatus = serde_json::from_slice(line)
                .map_err(|e| TetherError::InvalidArgument(format!("registration frame: {}", e)))?;
            tracing::debug!(status = ?frame.status, "Registration frame");

            if frame.status == HandshakeState::Error {
                return Err(TetherError::FailedPrecondition(
                    frame.error.unwrap_or_else(|| "coordinator reported an error".into()),
                ));
            }
            trust.accept(&frame).await?;
            last = Some(frame.status);
        }
    }
    last.ok_or_else(|| TetherError::Unavailable("registration stream ended without frames".into()))
}

/// One registration attempt; partially installed trust is undone on failure
async fn get_registered(
    http: &reqwest::Client,
    registry_url: &str,
    sealed: &EncryptedCallback,
    whitelist: &Whitelist,
    slot: &CoordinatorSlot,
) -> Result<CoordinatorIdentity, TetherError> {
    let resp = http
        .post(format!("{}{}", registry_url, paths::REGISTER))
        .json(sealed)
        .send()
        .await
        .map_err(|e| TetherError::Unavailable(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(rpc::error_from_response(resp).await);
    }

    let mut trust = Trust {
        whitelist,
        slot,
        installed: None,
    };
    match read_frames(resp, &mut trust).await {
        Ok(HandshakeState::Done) => trust
            .installed
            .ok_or_else(|| TetherError::Internal("DONE without coordinator identity".into())),
        Ok(state) => {
            trust.rollback().await;
            Err(TetherError::Unavailable(format!("registration ended in {:?}", state)))
        }
        Err(e) => {
            trust.rollback().await;
            Err(e)
        }
    }
}

/// Wait for the registry, then register, retrying until `register_timeout`.
///
/// A payload the coordinator rejects outright (wrong flock key, malformed
/// identity) is not retried.
pub async fn join_fleet(
    http: &reqwest::Client,
    flock: &FlockKey,
    settings: &JoinSettings,
    me: &JoinIdentity,
    whitelist: &Whitelist,
    slot: &CoordinatorSlot,
) -> Result<CoordinatorIdentity, TetherError> {
    rpc::ping_sleep(http, &settings.registry_url, settings.ping_delay, settings.ping_timeout).await?;

    let sealed = EncryptedCallback {
        nodeid_enc: flock.seal_text(&me.nodeid.to_string())?,
        netid_enc: flock.seal_text(&me.netid.to_string())?,
        pubkey_enc: flock.seal_text(&me.pubkey.to_json()?)?,
    };

    let deadline = Instant::now() + settings.register_timeout;
    let pause = Duration::from_millis(REGISTER_RETRY_PAUSE_MS);
    loop {
        match get_registered(http, &settings.registry_url, &sealed, whitelist, slot).await {
            Ok(identity) => {
                info!(coordinator = %identity.netid, "🤝 Registered with coordinator");
                return Ok(identity);
            }
            Err(e @ TetherError::InvalidArgument(_)) => return Err(e),
            Err(e) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(e);
                }
                warn!(error = %e, "Registration attempt failed");
                tokio::time::sleep(pause.min(deadline - now)).await;
            }
        }
    }
}
