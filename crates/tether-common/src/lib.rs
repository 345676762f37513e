//! # Tether Common
//!
//! Shared identities, wire types and rules used across Tether components.
//!
//! ## Modules
//! - `ids` - NodeID / NetID / KeyID parsing and local correlation ids
//! - `types` - JSON wire types (records, deltas, acks, handshake frames)
//! - `visibility` - horde-scoped rule engine for catalog filtering
//! - `error` - Common error types
//! - `constants` - Shared configuration constants

pub mod constants;
pub mod error;
pub mod ids;
pub mod types;
pub mod visibility;

pub use error::{Result, TetherError};
pub use ids::{KeyId, NetId, NodeId};
pub use types::*;
