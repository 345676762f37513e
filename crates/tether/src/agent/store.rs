//! Durable record store.
//!
//! Each record lives in exactly one of three maps: pending (accepted
//! locally, not yet acknowledged by the coordinator), completed (the
//! coordinator returned a transaction id) or failed. A bidirectional map
//! ties local ids to the coordinator's transaction ids. After every
//! mutation all five maps are checkpointed to JSON files in the store's
//! directory.

use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use tether_common::TetherError;
use tether_common::constants::files;

fn storage(path: &Path, e: impl std::fmt::Display) -> TetherError {
    TetherError::Storage(format!("{}: {}", path.display(), e))
}

/// Write `bytes` to `path` with owner-only permissions, replacing it atomically
pub(crate) async fn write_private_file(path: &Path, bytes: &[u8]) -> Result<(), TetherError> {
    let tmp = path.with_extension("tmp");
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp).await.map_err(|e| storage(&tmp, e))?;
    file.write_all(bytes).await.map_err(|e| storage(&tmp, e))?;
    file.sync_all().await.map_err(|e| storage(&tmp, e))?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(|e| storage(path, e))
}

/// Pretty JSON with a trailing newline
fn encode<S: Serialize>(value: &S) -> Result<Vec<u8>, TetherError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| TetherError::Internal(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

async fn read_map<V: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, V>, TetherError> {
    match tokio::fs::read(path).await {
        Ok(raw) if raw.is_empty() => Ok(BTreeMap::new()),
        Ok(raw) => serde_json::from_slice(&raw).map_err(|e| storage(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(storage(path, e)),
    }
}

#[derive(Debug)]
struct Maps<T> {
    pending: BTreeMap<String, T>,
    completed: BTreeMap<String, T>,
    failed: BTreeMap<String, T>,
    /// local id to coordinator transaction id
    to_remote: BTreeMap<String, String>,
    /// coordinator transaction id to local id
    to_local: BTreeMap<String, String>,
}

impl<T> Default for Maps<T> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            completed: BTreeMap::new(),
            failed: BTreeMap::new(),
            to_remote: BTreeMap::new(),
            to_local: BTreeMap::new(),
        }
    }
}

/// Which map a record currently sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Completed,
    Failed,
}

/// Point-in-time copy of a store, for inspection
#[derive(Debug, Clone)]
pub struct StoreSnapshot<T> {
    pub pending: BTreeMap<String, T>,
    pub completed: BTreeMap<String, T>,
    pub failed: BTreeMap<String, T>,
    pub to_remote: BTreeMap<String, String>,
    pub to_local: BTreeMap<String, String>,
}

pub struct RecordStore<T> {
    dir: PathBuf,
    maps: Mutex<Maps<T>>,
}

impl<T> RecordStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Open the store in `dir`, creating it and loading any checkpoint
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, TetherError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| storage(&dir, e))?;
        let store = Self {
            dir,
            maps: Mutex::new(Maps::default()),
        };
        store.load_all().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replace in-memory state with the checkpoint on disk
    pub async fn load_all(&self) -> Result<(), TetherError> {
        let loaded = Maps {
            pending: read_map(&self.dir.join(files::PENDING)).await?,
            completed: read_map(&self.dir.join(files::COMPLETED)).await?,
            failed: read_map(&self.dir.join(files::FAILED)).await?,
            to_remote: read_map(&self.dir.join(files::TO_REMOTE)).await?,
            to_local: read_map(&self.dir.join(files::TO_LOCAL)).await?,
        };
        *self.maps.lock().await = loaded;
        Ok(())
    }

    async fn checkpoint(&self, maps: &Maps<T>) -> Result<(), TetherError> {
        let entries = [
            (files::PENDING, encode(&maps.pending)?),
            (files::COMPLETED, encode(&maps.completed)?),
            (files::FAILED, encode(&maps.failed)?),
            (files::TO_REMOTE, encode(&maps.to_remote)?),
            (files::TO_LOCAL, encode(&maps.to_local)?),
        ];
        for (name, bytes) in entries {
            write_private_file(&self.dir.join(name), &bytes).await?;
        }
        Ok(())
    }

    /// Accept a record locally. A record already completed is left alone.
    pub async fn record_pending(&self, local: &str, record: T) -> Result<RecordState, TetherError> {
        if local.is_empty() {
            return Err(TetherError::InvalidArgument("empty local id".into()));
        }
        let mut maps = self.maps.lock().await;
        if maps.completed.contains_key(local) {
            return Ok(RecordState::Completed);
        }
        maps.failed.remove(local);
        maps.pending.insert(local.to_string(), record);
        self.checkpoint(&maps).await?;
        Ok(RecordState::Pending)
    }

    /// Move a record to completed and link it to the coordinator's transaction id
    pub async fn record_completed(&self, local: &str, remote: &str, record: T) -> Result<(), TetherError> {
        if local.is_empty() || remote.is_empty() {
            return Err(TetherError::InvalidArgument(
                "completion needs both local and remote ids".into(),
            ));
        }
        let mut maps = self.maps.lock().await;
        maps.pending.remove(local);
        maps.failed.remove(local);
        maps.completed.insert(local.to_string(), record);
        if let Some(old) = maps.to_remote.insert(local.to_string(), remote.to_string()) {
            maps.to_local.remove(&old);
        }
        maps.to_local.insert(remote.to_string(), local.to_string());
        self.checkpoint(&maps).await
    }

    /// Move a record to failed
    pub async fn record_failed(&self, local: &str, remote: Option<&str>, record: T) -> Result<(), TetherError> {
        if local.is_empty() {
            return Err(TetherError::InvalidArgument("empty local id".into()));
        }
        let mut maps = self.maps.lock().await;
        maps.pending.remove(local);
        maps.completed.remove(local);
        maps.failed.insert(local.to_string(), record);
        if let Some(remote) = remote.filter(|r| !r.is_empty()) {
            maps.to_remote.insert(local.to_string(), remote.to_string());
            maps.to_local.insert(remote.to_string(), local.to_string());
        }
        self.checkpoint(&maps).await
    }

    pub async fn state_of(&self, local: &str) -> Option<RecordState> {
        let maps = self.maps.lock().await;
        if maps.pending.contains_key(local) {
            Some(RecordState::Pending)
        } else if maps.completed.contains_key(local) {
            Some(RecordState::Completed)
        } else if maps.failed.contains_key(local) {
            Some(RecordState::Failed)
        } else {
            None
        }
    }

    /// Pending or completed
    pub async fn is_live(&self, local: &str) -> bool {
        matches!(
            self.state_of(local).await,
            Some(RecordState::Pending | RecordState::Completed)
        )
    }

    pub async fn pending(&self) -> Vec<(String, T)> {
        self.maps
            .lock()
            .await
            .pending
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn remote_for(&self, local: &str) -> Option<String> {
        self.maps.lock().await.to_remote.get(local).cloned()
    }

    pub async fn local_for(&self, remote: &str) -> Option<String> {
        self.maps.lock().await.to_local.get(remote).cloned()
    }

    pub async fn snapshot(&self) -> StoreSnapshot<T> {
        let maps = self.maps.lock().await;
        StoreSnapshot {
            pending: maps.pending.clone(),
            completed: maps.completed.clone(),
            failed: maps.failed.clone(),
            to_remote: maps.to_remote.clone(),
            to_local: maps.to_local.clone(),
        }
    }
}
