//! Wire types exchanged between agents and the coordinator.

use serde::{Deserialize, Serialize};

use crate::constants::ACK_TS_FORMAT;

/// Current time in the layout used on acks and handshake frames
pub fn ack_timestamp() -> String {
    chrono::Utc::now().format(ACK_TS_FORMAT).to_string()
}

/// Public key as carried in client records and handshake frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKey {
    /// Service revision owning the key
    pub service: String,
    /// Principal owning the key
    pub name: String,
    /// Canonical KeyID string
    pub keyid: String,
    /// URL-safe base64 ed25519 public key
    pub pubkey: String,
    /// Coordinator state in which the key was added (0 until applied)
    #[serde(default)]
    pub stateadded: i64,
}

impl PubKey {
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| crate::TetherError::InvalidArgument(format!("bad pubkey json: {}", e)))
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::TetherError::Internal(format!("pubkey json: {}", e)))
    }
}

/// Lifecycle of a client key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyStatus {
    Current,
    Deprecated,
    Revoked,
}

impl Default for KeyStatus {
    fn default() -> Self {
        Self::Current
    }
}

/// Reachability of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    Up,
    Down,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::Up
    }
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "CURRENT",
            Self::Deprecated => "DEPRECATED",
            Self::Revoked => "REVOKED",
        }
    }
}

/// A principal to be trusted as a caller of a service revision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    pub nodeid: String,
    pub keyid: String,
    pub keyjson: String,
    #[serde(default)]
    pub status: KeyStatus,
}

/// A reachable service instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointData {
    pub nodeid: String,
    pub netid: String,
    #[serde(default)]
    pub status: ServiceState,
    /// Content hash of the plugin serving this endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// When the agent accepted the registration
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    /// Last time the agent heard from the endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_message_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Working,
    Done,
    Fail,
}

/// Acknowledgement returned by every mutating call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remoteuuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub localuuid: String,
    #[serde(default)]
    pub state: i64,
    pub ts: String,
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn new(status: AckStatus) -> Self {
        Self {
            remoteuuid: String::new(),
            localuuid: String::new(),
            state: 0,
            ts: ack_timestamp(),
            status,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Pingu {
    Ping,
    Pong,
    /// Anything else; answered with a failed precondition
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub value: Pingu,
}

/// Joining agent identity, each field flock-encrypted then base64 encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedCallback {
    pub nodeid_enc: String,
    pub netid_enc: String,
    pub pubkey_enc: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HandshakeState {
    Busy,
    Done,
    Error,
}

/// One frame of the streamed handshake reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterStatus {
    pub status: HandshakeState,
    pub ts: String,
    /// Coordinator NodeID
    pub nodeid: String,
    /// Coordinator NetID
    pub netid: String,
    /// Coordinator public key JSON
    pub pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Endpoint identity pair pushed in endpoint deltas
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpInfo {
    pub nodeid: String,
    pub netid: String,
}

/// One catalog row shown to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogInfo {
    pub nodeid: String,
    pub netid: String,
    /// Plugin content hash, `n/a` when unknown
    pub filename: String,
}

/// Allow-list entry: in `horde`, callers of service `from` may reach service `to`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleInfo {
    pub rule: String,
    pub horde: String,
    pub from: String,
    pub to: String,
    pub owner: String,
}

/// Whitelist delta pushed to an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WlDelta {
    pub state: i64,
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub del: Vec<String>,
}

/// Endpoint delta pushed to an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpDelta {
    pub state: i64,
    #[serde(default)]
    pub add: Vec<EpInfo>,
    #[serde(default)]
    pub del: Vec<EpInfo>,
}

/// Catalog and rules snapshot for one horde
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDelta {
    pub list: Vec<CatalogInfo>,
    pub rules: Vec<RuleInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRequest {
    pub nodeid: String,
    pub keyid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsUpRequest {
    pub nodeid: String,
    pub keyid: String,
    #[serde(default)]
    pub limit: usize,
}

/// Endpoint visible to a caller, as returned by `EndpointsUp`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointEntry {
    pub nodeid: String,
    pub netid: String,
    pub stateadded: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRemoval {
    pub rule: String,
    pub horde: String,
}
