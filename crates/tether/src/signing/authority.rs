//! Request signing and verification.
//!
//! Every signed request carries four headers:
//!
//! | header        | value                                    |
//! |---------------|------------------------------------------|
//! | `x-key-id`    | KeyID of the signer                      |
//! | `x-algorithm` | signature algorithm, `ed25519`           |
//! | `x-date`      | RFC 3339 timestamp                       |
//! | `x-signature` | URL-safe base64 signature                |
//!
//! The signature covers `"<METHOD> <path>\n<date>\n<base64 sha256(body)>"`.

use axum::http::HeaderMap;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use tether_common::constants::{ED25519_ALGORITHM, SIGNATURE_SKEW_SECS, headers};
use tether_common::{KeyId, PubKey, TetherError};

use super::keys::{KeyPair, verify_signature, verifying_key};

/// Headers attached to an outbound signed request
#[derive(Clone, Debug)]
pub struct SignedHeaders {
    pub key_id: String,
    pub algorithm: String,
    pub date: String,
    pub signature: String,
}

/// Anything that can sign outbound calls
pub trait SignerApi: Send + Sync {
    fn key_id(&self) -> &KeyId;
    fn sign_request(&self, method: &str, path: &str, body: &[u8]) -> SignedHeaders;
}

/// Canonical string covered by a request signature
pub fn signing_string(method: &str, path: &str, date: &str, body: &[u8]) -> String {
    let digest = URL_SAFE_NO_PAD.encode(Sha256::digest(body));
    format!("{} {}\n{}\n{}", method.to_uppercase(), path, date, digest)
}

impl SignerApi for KeyPair {
    fn key_id(&self) -> &KeyId {
        KeyPair::key_id(self)
    }

    fn sign_request(&self, method: &str, path: &str, body: &[u8]) -> SignedHeaders {
        let date = Utc::now().to_rfc3339();
        let signature = self.sign(signing_string(method, path, &date, body).as_bytes());
        SignedHeaders {
            key_id: self.key_id().to_string(),
            algorithm: ED25519_ALGORITHM.to_string(),
            date,
            signature,
        }
    }
}

/// Public keys a service accepts signatures from, keyed by KeyID
#[derive(Clone, Default)]
pub struct Whitelist {
    keys: Arc<RwLock<HashMap<String, VerifyingKey>>>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a key after checking it matches its KeyID
    pub async fn add(&self, pk: &PubKey) -> Result<KeyId, TetherError> {
        let (key_id, key) = verifying_key(pk)?;
        self.keys.write().await.insert(key_id.to_string(), key);
        tracing::debug!(key_id = %key_id, "Whitelisted key");
        Ok(key_id)
    }

    pub async fn remove(&self, key_id: &str) -> bool {
        let removed = self.keys.write().await.remove(key_id).is_some();
        if removed {
            tracing::debug!(key_id = key_id, "Removed key from whitelist");
        }
        removed
    }

    pub async fn contains(&self, key_id: &str) -> bool {
        self.keys.read().await.contains_key(key_id)
    }

    pub async fn get(&self, key_id: &str) -> Option<VerifyingKey> {
        self.keys.read().await.get(key_id).copied()
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }
}

/// Verifies inbound signed requests against a whitelist
#[derive(Clone)]
pub struct SignatureAuthority {
    whitelist: Whitelist,
    allowed_algorithms: Arc<Vec<String>>,
    max_skew_secs: i64,
}

impl SignatureAuthority {
    pub fn new(whitelist: Whitelist, allowed_algorithms: Vec<String>) -> Self {
        Self {
            whitelist,
            allowed_algorithms: Arc::new(allowed_algorithms),
            max_skew_secs: SIGNATURE_SKEW_SECS,
        }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Check the signature headers on a request and return the signer
    pub async fn verify(
        &self,
        method: &str,
        path: &str,
        headers_in: &HeaderMap,
        body: &[u8],
    ) -> Result<KeyId, TetherError> {
        let key_id = header(headers_in, headers::X_KEY_ID)?;
        let algorithm = header(headers_in, headers::X_ALGORITHM)?;
        let date = header(headers_in, headers::X_DATE)?;
        let signature = header(headers_in, headers::X_SIGNATURE)?;

        if !self.allowed_algorithms.iter().any(|a| a == algorithm) {
            return Err(TetherError::Unauthenticated(format!(
                "algorithm {} is not accepted",
                algorithm
            )));
        }

        let signed_at = DateTime::parse_from_rfc3339(date)
            .map_err(|_| TetherError::Unauthenticated(format!("bad {} header", headers::X_DATE)))?;
        let skew = (Utc::now() - signed_at.with_timezone(&Utc)).num_seconds().abs();
        if skew > self.max_skew_secs {
            return Err(TetherError::Unauthenticated(format!(
                "signature date is {}s off",
                skew
            )));
        }

        let parsed: KeyId = key_id
            .parse()
            .map_err(|_| TetherError::Unauthenticated(format!("bad keyid {}", key_id)))?;
        let Some(key) = self.whitelist.get(key_id).await else {
            return Err(TetherError::Unauthenticated(format!("unknown key {}", key_id)));
        };

        let message = signing_string(method, path, date, body);
        verify_signature(&key, message.as_bytes(), signature)?;
        Ok(parsed)
    }
}

fn header<'a>(map: &'a HeaderMap, name: &'static str) -> Result<&'a str, TetherError> {
    map.get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| TetherError::Unauthenticated(format!("missing {} header", name)))
}
