//! ed25519 service keys and the signed-request authority.

mod authority;
mod keys;
mod middleware;

pub use authority::{SignatureAuthority, SignedHeaders, SignerApi, Whitelist, signing_string};
pub use keys::{KeyPair, fingerprint, verifying_key};
pub use middleware::{SignedBy, require_signature};
