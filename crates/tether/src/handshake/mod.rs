//! Registration handshake between a joining agent and the coordinator.
//!
//! The agent seals its NodeID, NetID and public key under the flock key and
//! posts them to the registry listener. The coordinator answers with a
//! stream of newline-delimited `RegisterStatus` frames: `BUSY` carrying its
//! own identity, then `DONE` once it has called the agent back over a signed
//! channel, or `ERROR` if that never succeeds.

mod client;
mod server;

pub use client::{JoinIdentity, JoinSettings, join_fleet};
pub use server::{AdmissionLedger, HandshakeServer, registry_router};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use tether_common::{KeyId, TetherError};

/// The coordinator an agent has registered with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorIdentity {
    pub nodeid: String,
    pub netid: String,
    pub keyid: String,
    /// PubKey JSON
    pub pubkey: String,
}

/// Holds the recorded coordinator identity, mirrored to `coordinator.json`
#[derive(Clone, Default)]
pub struct CoordinatorSlot {
    inner: Arc<RwLock<Option<CoordinatorIdentity>>>,
    path: Option<Arc<PathBuf>>,
}

impl CoordinatorSlot {
    /// In-memory slot, never persisted
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// Slot backed by `path`, loading any identity already recorded there
    pub async fn open(path: PathBuf) -> Result<Self, TetherError> {
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                TetherError::Storage(format!("{}: {}", path.display(), e))
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(TetherError::Storage(format!("{}: {}", path.display(), e))),
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(current)),
            path: Some(Arc::new(path)),
        })
    }

    pub async fn get(&self) -> Option<CoordinatorIdentity> {
        self.inner.read().await.clone()
    }

    pub async fn is_recorded(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// True when `signer` is the recorded coordinator key
    pub async fn is_coordinator(&self, signer: &KeyId) -> bool {
        let signer = signer.to_string();
        self.inner
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.keyid == signer)
    }

    pub async fn set(&self, identity: CoordinatorIdentity) -> Result<(), TetherError> {
        let mut guard = self.inner.write().await;
        if let Some(path) = &self.path {
            let raw = serde_json::to_vec_pretty(&identity)
                .map_err(|e| TetherError::Internal(e.to_string()))?;
            crate::agent::write_private_file(path, &raw).await?;
        }
        *guard = Some(identity);
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), TetherError> {
        let mut guard = self.inner.write().await;
        *guard = None;
        if let Some(path) = &self.path {
            match tokio::fs::remove_file(path.as_ref()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(TetherError::Storage(format!("{}: {}", path.display(), e))),
            }
        }
        Ok(())
    }
}
