//! Flock key: the symmetric secret shared by every member of a fleet.
//!
//! The handshake payload is sealed with ChaCha20-Poly1305 under this key.
//! Sealed values are `nonce(12) | ciphertext | tag(16)`, URL-safe base64
//! when carried as text.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};

use tether_common::TetherError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Clone)]
pub struct FlockKey {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for FlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FlockKey(..)")
    }
}

impl FlockKey {
    pub fn generate() -> Self {
        let generated = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(generated.as_slice());
        Self { key }
    }

    /// Parse a flock key from its base64 text form
    pub fn parse(text: &str) -> Result<Self, TetherError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| TetherError::Config(format!("flock key encoding: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| TetherError::Config(format!("flock key must be {} bytes", KEY_LEN)))?;
        Ok(Self { key })
    }

    pub fn to_text(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.key)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, TetherError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|_| TetherError::Crypto("flock encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, TetherError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(TetherError::InvalidArgument("sealed payload too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TetherError::InvalidArgument("payload does not decrypt under flock key".into()))
    }

    /// Seal a string field for the wire
    pub fn seal_text(&self, plaintext: &str) -> Result<String, TetherError> {
        Ok(URL_SAFE_NO_PAD.encode(self.seal(plaintext.as_bytes())?))
    }

    pub fn open_text(&self, sealed: &str) -> Result<String, TetherError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|e| TetherError::InvalidArgument(format!("sealed field encoding: {}", e)))?;
        String::from_utf8(self.open(&bytes)?)
            .map_err(|_| TetherError::InvalidArgument("sealed field is not UTF-8".into()))
    }
}
