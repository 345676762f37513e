//! Service key pairs.
//!
//! Each service signs with an ed25519 key whose identity is a KeyID:
//! `/<ServiceRev>/<principal>/keys/<fingerprint>`, where the fingerprint is
//! the first 16 bytes of SHA-256 over the public key.

use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::path::Path;

use tether_common::ids::format_fingerprint;
use tether_common::{KeyId, PubKey, TetherError};

/// Fingerprint of an ed25519 public key
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    format_fingerprint(&head)
}

/// Decode and check the key material carried in a `PubKey`.
///
/// The KeyID must parse, must not be a query, and its fingerprint must be
/// the fingerprint of the enclosed key.
pub fn verifying_key(pk: &PubKey) -> Result<(KeyId, VerifyingKey), TetherError> {
    let key_id: KeyId = pk.keyid.parse()?;
    if key_id.is_query() {
        return Err(TetherError::InvalidArgument(format!(
            "query keyid {} cannot carry a key",
            pk.keyid
        )));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(&pk.pubkey)
        .map_err(|e| TetherError::InvalidArgument(format!("pubkey encoding: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TetherError::InvalidArgument("invalid public key length".into()))?;
    let key = VerifyingKey::from_bytes(&bytes)
        .map_err(|e| TetherError::InvalidArgument(format!("invalid public key: {}", e)))?;
    if fingerprint(&key) != key_id.fingerprint {
        return Err(TetherError::InvalidArgument(format!(
            "keyid {} does not match key material",
            pk.keyid
        )));
    }
    Ok((key_id, key))
}

/// Verify a URL-safe base64 signature over `message`
pub fn verify_signature(key: &VerifyingKey, message: &[u8], sig_b64: &str) -> Result<(), TetherError> {
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TetherError::Unauthenticated("invalid signature encoding".into()))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| TetherError::Unauthenticated("invalid signature length".into()))?;
    key.verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| TetherError::Unauthenticated("invalid signature".into()))
}

/// A service's signing key with its public identity
pub struct KeyPair {
    signing_key: SigningKey,
    key_id: KeyId,
    pubkey: PubKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("key_id", &self.key_id.to_string()).finish()
    }
}

impl KeyPair {
    /// Wrap an existing signing key
    pub fn from_signing_key(signing_key: SigningKey, service_rev: &str, principal: &str) -> Result<Self> {
        let verifying = signing_key.verifying_key();
        let key_id = KeyId::new(service_rev, principal, &fingerprint(&verifying))
            .context("Failed to build keyid")?;
        let pubkey = PubKey {
            service: service_rev.to_string(),
            name: principal.to_string(),
            keyid: key_id.to_string(),
            pubkey: URL_SAFE_NO_PAD.encode(verifying.as_bytes()),
            stateadded: 0,
        };
        Ok(Self {
            signing_key,
            key_id,
            pubkey,
        })
    }

    /// Generate a fresh key pair
    pub fn generate(service_rev: &str, principal: &str) -> Result<Self> {
        use rand_core::OsRng;
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing, service_rev, principal)
    }

    /// Load the 32-byte private key at `path`, generating and saving one if absent
    pub fn load_or_generate(path: Option<&Path>, service_rev: &str, principal: &str) -> Result<Self> {
        let Some(path) = path else {
            tracing::warn!(service = service_rev, "Using ephemeral service key (will change on restart)");
            return Self::generate(service_rev, principal);
        };

        if path.exists() {
            let key_bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read private key file {}", path.display()))?;
            if key_bytes.len() != 32 {
                bail!("Invalid private key length (expected 32 bytes)");
            }
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&key_bytes);
            return Self::from_signing_key(SigningKey::from_bytes(&bytes), service_rev, principal);
        }

        let pair = Self::generate(service_rev, principal)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create key directory")?;
        }
        write_private(path, pair.signing_key.as_bytes())?;
        tracing::info!(key_id = %pair.key_id, path = %path.display(), "Generated service key");
        Ok(pair)
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    pub fn pubkey(&self) -> &PubKey {
        &self.pubkey
    }

    pub fn pubkey_json(&self) -> Result<String, TetherError> {
        self.pubkey.to_json()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign `message`, returning a URL-safe base64 signature
    pub fn sign(&self, message: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.sign(message).to_bytes())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .context("Failed to create private key file")?;
    file.write_all(bytes).context("Failed to write private key")?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).context("Failed to write private key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyid_matches_fingerprint() {
        let pair = KeyPair::generate("Reeve1", "PRINCIPAL").unwrap();
        let (key_id, key) = verifying_key(pair.pubkey()).unwrap();
        assert_eq!(&key_id, pair.key_id());
        assert_eq!(key, pair.verifying_key());
        assert_eq!(pair.key_id().fingerprint.len(), 47);
    }

    #[test]
    fn test_mismatched_keyid_rejected() {
        let a = KeyPair::generate("Reeve1", "A").unwrap();
        let b = KeyPair::generate("Reeve1", "A").unwrap();
        let mut forged = a.pubkey().clone();
        forged.pubkey = b.pubkey().pubkey.clone();
        assert!(verifying_key(&forged).is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let pair = KeyPair::generate("Steward1", "S").unwrap();
        let sig = pair.sign(b"payload");
        assert!(verify_signature(&pair.verifying_key(), b"payload", &sig).is_ok());
        assert!(verify_signature(&pair.verifying_key(), b"other", &sig).is_err());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/reeve.key");
        let first = KeyPair::load_or_generate(Some(&path), "Reeve1", "P").unwrap();
        let second = KeyPair::load_or_generate(Some(&path), "Reeve1", "P").unwrap();
        assert_eq!(first.key_id(), second.key_id());
    }
}
