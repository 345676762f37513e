//! Shared constants for Tether components.

/// Default agent HTTP listen address
pub const DEFAULT_AGENT_ADDR: &str = "127.0.0.1:50059";

/// Default coordinator (steward) HTTP listen address
pub const DEFAULT_COORDINATOR_ADDR: &str = "127.0.0.1:50060";

/// Default registry (handshake) HTTP listen address
pub const DEFAULT_REGISTRY_ADDR: &str = "127.0.0.1:50061";

/// Coordinator ingest tick period (3 seconds)
pub const DEFAULT_TICK_MS: u64 = 3000;

/// First logical state handed out by the coordinator clock
pub const FIRST_STATE: i64 = 1;

/// Overall deadline for the reverse callback to a joining agent
pub const DEFAULT_REEVE_TIMEOUT_MS: u64 = 10_000;

/// Delay between reverse callback attempts
pub const DEFAULT_CALLBACK_RETRY_MS: u64 = 1000;

/// Delay between liveness pings while waiting on a peer
pub const DEFAULT_PING_DELAY_MS: u64 = 1000;

/// Deadline for the startup wait on the coordinator
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 30_000;

/// Deadline for the whole caller-side handshake
pub const DEFAULT_REGISTER_TIMEOUT_MS: u64 = 30_000;

/// Pause between caller-side handshake attempts
pub const REGISTER_RETRY_PAUSE_MS: u64 = 2000;

/// Forwarder intake queue depth (per queue)
pub const DEFAULT_FORWARDER_QUEUE: usize = 256;

/// Accepted clock skew on signed requests (seconds)
pub const SIGNATURE_SKEW_SECS: i64 = 300;

/// Largest request body buffered for signature verification
pub const MAX_SIGNED_BODY_BYTES: usize = 1024 * 1024;

/// Signature algorithm produced by this implementation
pub const ED25519_ALGORITHM: &str = "ed25519";

/// Timestamp layout used on acks and handshake frames
pub const ACK_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Logical service names carried in NodeIDs and NetIDs
pub mod services {
    /// Per-node agent
    pub const REEVE: &str = "Reeve";

    /// Agent API name
    pub const REEVE_API: &str = "ReeveAPI";

    /// Agent service revision
    pub const REEVE_REV: &str = "Reeve1";

    /// Fleet coordinator
    pub const STEWARD: &str = "Steward";

    /// Coordinator API name
    pub const STEWARD_API: &str = "StewardAPI";

    /// Coordinator service revision
    pub const STEWARD_REV: &str = "Steward1";

    /// Registration handshake service revision
    pub const REGISTRY_REV: &str = "Registry1";
}

/// Agent checkpoint file names (one per logical map)
pub mod files {
    pub const PENDING: &str = "pending.json";
    pub const COMPLETED: &str = "completed.json";
    pub const FAILED: &str = "failed.json";
    pub const TO_LOCAL: &str = "tolocal.json";
    pub const TO_REMOTE: &str = "toremote.json";

    /// Recorded coordinator identity
    pub const COORDINATOR: &str = "coordinator.json";
}

/// HTTP header names for request signatures
pub mod headers {
    /// KeyID of the signer
    pub const X_KEY_ID: &str = "x-key-id";

    /// Signature algorithm
    pub const X_ALGORITHM: &str = "x-algorithm";

    /// RFC 3339 signing time
    pub const X_DATE: &str = "x-date";

    /// URL-safe base64 signature
    pub const X_SIGNATURE: &str = "x-signature";
}
