//! Identity strings for nodes, network endpoints and keys.
//!
//! ```text
//! NodeID  /<bloc>/<horde>/<node>/<ServiceName>/<ServiceAPI>
//! NetID   /<ServiceRev>/<principal>/net/<host>:<port>
//! KeyID   /<ServiceRev>/<principal>/keys/<fingerprint>
//! ```
//!
//! NetIDs and KeyIDs may be written in a query form (`*` or empty parts);
//! those parse but never name a concrete endpoint or key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, TetherError};

/// Offset of the final `:` in a 16-byte colon separated hex fingerprint
const FINGERPRINT_LAST_COLON: usize = 44;

fn bad_id(id: &str) -> TetherError {
    TetherError::InvalidArgument(format!("bad service identifier >{}<", id))
}

/// Service identifiers are empty, `self`, or an uppercase letter followed
/// by letters, digits or underscores.
pub fn good_id(id: &str) -> bool {
    if id == "self" {
        return true;
    }
    let mut chars = id.chars();
    match chars.next() {
        None => true,
        Some(first) if first.is_uppercase() => {
            std::iter::once(first)
                .chain(chars)
                .all(|c| c.is_alphanumeric() || c == '_')
        }
        Some(_) => false,
    }
}

/// Deterministic local id for a record: name-based UUID of its identity string
pub fn local_uuid(identity: &str) -> Uuid {
    Uuid::new_v3(&Uuid::nil(), identity.as_bytes())
}

/// Render 16 fingerprint bytes as `xx:xx:...:xx`
pub fn format_fingerprint(bytes: &[u8; 16]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn strip_leading_slash(s: &str) -> &str {
    s.strip_prefix('/').unwrap_or(s)
}

/// The node identity of a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub bloc: String,
    pub horde: String,
    pub node: String,
    pub service_name: String,
    pub service_api: String,
}

impl NodeId {
    pub fn new(bloc: &str, horde: &str, node: &str, service_name: &str, service_api: &str) -> Result<Self> {
        let candidate = Self {
            bloc: bloc.to_string(),
            horde: horde.to_string(),
            node: node.to_string(),
            service_name: service_name.to_string(),
            service_api: service_api.to_string(),
        };
        candidate.to_string().parse()
    }
}

impl FromStr for NodeId {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(TetherError::InvalidArgument("empty nodeID input".into()));
        }
        let parts: Vec<&str> = strip_leading_slash(s).split('/').collect();
        if parts.len() != 5 {
            return Err(TetherError::InvalidArgument(format!(
                "nodeID {} does not have 5 parts",
                s
            )));
        }
        if !good_id(parts[3]) {
            return Err(bad_id(parts[3]));
        }
        if !good_id(parts[4]) {
            return Err(bad_id(parts[4]));
        }
        Ok(Self {
            bloc: parts[0].to_string(),
            horde: parts[1].to_string(),
            node: parts[2].to_string(),
            service_name: parts[3].to_string(),
            service_api: parts[4].to_string(),
        })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}/{}",
            self.bloc, self.horde, self.node, self.service_name, self.service_api
        )
    }
}

/// The network identity of a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetId {
    pub service_rev: String,
    pub principal: String,
    /// Empty for a wildcard address
    pub host: String,
    pub port: u16,
    /// Some part of this NetID is a wildcard
    pub query: bool,
}

impl NetId {
    pub fn new(service_rev: &str, principal: &str, host: &str, port: u16) -> Result<Self> {
        let candidate = Self {
            service_rev: service_rev.to_string(),
            principal: principal.to_string(),
            host: host.to_string(),
            port,
            query: false,
        };
        candidate.to_string().parse()
    }

    /// Build from a `host:port` address string
    pub fn from_address(service_rev: &str, principal: &str, address: &str) -> Result<Self> {
        let (host, port) = split_address(address)?;
        Self::new(service_rev, principal, host, port)
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL for HTTP calls to this endpoint
    pub fn http_url(&self) -> String {
        format!("http://{}", self.address())
    }
}

/// Split `host:port` on the final colon
pub fn split_address(address: &str) -> Result<(&str, u16)> {
    let idx = address.rfind(':').ok_or_else(|| {
        TetherError::InvalidArgument(format!("no : delimited port at the end of {}", address))
    })?;
    let (host, port) = (&address[..idx], &address[idx + 1..]);
    let port: u16 = port
        .parse()
        .map_err(|_| TetherError::InvalidArgument(format!("port is not a number: {}", port)))?;
    if host.is_empty() {
        return Err(TetherError::InvalidArgument(format!(
            "host '{}' too short to be resolvable",
            host
        )));
    }
    Ok((host, port))
}

impl FromStr for NetId {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(TetherError::InvalidArgument("empty netID input".into()));
        }
        let halves: Vec<&str> = s.split("/net/").collect();
        if halves.len() != 2 {
            return Err(TetherError::InvalidArgument(
                "netID failed to parse out 2 '/net/' delimited parts".into(),
            ));
        }
        let names: Vec<&str> = strip_leading_slash(halves[0]).split('/').collect();
        if names.len() != 2 {
            return Err(TetherError::InvalidArgument(
                "netID failed to parse out leading /servicerev/principal fields".into(),
            ));
        }
        let (service_rev, principal) = (names[0], names[1]);
        let query = [service_rev, principal]
            .iter()
            .any(|part| part.is_empty() || *part == "*");

        let address = halves[1];
        if address.is_empty() || address == "*" {
            return Ok(Self {
                service_rev: service_rev.to_string(),
                principal: principal.to_string(),
                host: String::new(),
                port: 0,
                query: true,
            });
        }
        let (host, port) = split_address(address)?;
        if !good_id(service_rev) {
            return Err(bad_id(service_rev));
        }
        Ok(Self {
            service_rev: service_rev.to_string(),
            principal: principal.to_string(),
            host: host.to_string(),
            port,
            query,
        })
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.is_empty() {
            write!(f, "/{}/{}/net/*", self.service_rev, self.principal)
        } else {
            write!(
                f,
                "/{}/{}/net/{}:{}",
                self.service_rev, self.principal, self.host, self.port
            )
        }
    }
}

/// The identity of a public key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId {
    pub service_rev: String,
    pub principal: String,
    /// Empty for a query KeyID
    pub fingerprint: String,
}

impl KeyId {
    pub fn new(service_rev: &str, principal: &str, fingerprint: &str) -> Result<Self> {
        let candidate = Self {
            service_rev: service_rev.to_string(),
            principal: principal.to_string(),
            fingerprint: fingerprint.to_string(),
        };
        let parsed: Self = candidate.to_string().parse()?;
        if parsed.is_query() {
            return Err(TetherError::InvalidArgument(format!(
                "keyID {} has no fingerprint",
                candidate
            )));
        }
        Ok(parsed)
    }

    pub fn is_query(&self) -> bool {
        self.fingerprint.is_empty()
    }
}

impl FromStr for KeyId {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(TetherError::InvalidArgument("empty keyID input".into()));
        }
        let halves: Vec<&str> = s.split("/keys/").collect();
        if halves.len() != 2 {
            return Err(TetherError::InvalidArgument(
                "keyID failed to parse out 2 '/keys/' delimited parts".into(),
            ));
        }
        let names: Vec<&str> = strip_leading_slash(halves[0]).split('/').collect();
        if names.len() != 2 {
            return Err(TetherError::InvalidArgument(
                "keyID failed to parse out leading /servicerev/principal fields".into(),
            ));
        }
        let fingerprint = halves[1];
        if fingerprint.is_empty() || fingerprint == "*" {
            return Ok(Self {
                service_rev: names[0].to_string(),
                principal: names[1].to_string(),
                fingerprint: String::new(),
            });
        }
        if fingerprint.rfind(':') != Some(FINGERPRINT_LAST_COLON) {
            return Err(TetherError::InvalidArgument(format!(
                "keyID failed to parse fingerprint : {}",
                fingerprint
            )));
        }
        if !good_id(names[0]) {
            return Err(bad_id(names[0]));
        }
        Ok(Self {
            service_rev: names[0].to_string(),
            principal: names[1].to_string(),
            fingerprint: fingerprint.to_string(),
        })
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fingerprint = if self.fingerprint.is_empty() { "*" } else { &self.fingerprint };
        write!(f, "/{}/{}/keys/{}", self.service_rev, self.principal, fingerprint)
    }
}
