//! Configuration management for Tether.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tether_common::constants::{
    DEFAULT_AGENT_ADDR, DEFAULT_CALLBACK_RETRY_MS, DEFAULT_COORDINATOR_ADDR, DEFAULT_FORWARDER_QUEUE,
    DEFAULT_PING_DELAY_MS, DEFAULT_PING_TIMEOUT_MS, DEFAULT_REEVE_TIMEOUT_MS,
    DEFAULT_REGISTER_TIMEOUT_MS, DEFAULT_REGISTRY_ADDR, DEFAULT_TICK_MS, ED25519_ALGORITHM,
};

use crate::flock::FlockKey;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Services to start on this node, in order
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    /// Directory for keys, checkpoints and the registry database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Flock key in its base64 text form
    #[serde(default)]
    pub flock_key: Option<String>,

    /// File holding the flock key, used when `flock_key` is unset
    #[serde(default)]
    pub flock_key_file: Option<PathBuf>,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

/// Where this node sits in the fleet
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_bloc")]
    pub bloc: String,

    #[serde(default = "default_horde")]
    pub horde: String,

    /// Node name (generated if not set)
    #[serde(default = "generate_node_name")]
    pub node: String,

    /// Principal shared by this node's services (generated and kept in
    /// `<data_dir>/principal` if not set)
    #[serde(default)]
    pub principal: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            bloc: default_bloc(),
            horde: default_horde(),
            node: generate_node_name(),
            principal: None,
        }
    }
}

/// Agent (Reeve) settings
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_addr")]
    pub listen_addr: String,

    /// Registry listener of the coordinator to join
    #[serde(default = "default_registry_addr")]
    pub registry_addr: String,

    #[serde(default = "default_ping_delay")]
    pub ping_delay_ms: u64,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    #[serde(default = "default_register_timeout")]
    pub register_timeout_ms: u64,

    /// Capacity of each forwarder queue
    #[serde(default = "default_forwarder_queue")]
    pub forwarder_queue: usize,

    /// Signature algorithms accepted on inbound calls
    #[serde(default = "default_algorithms")]
    pub allowed_algorithms: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_agent_addr(),
            registry_addr: default_registry_addr(),
            ping_delay_ms: default_ping_delay(),
            ping_timeout_ms: default_ping_timeout(),
            register_timeout_ms: default_register_timeout(),
            forwarder_queue: default_forwarder_queue(),
            allowed_algorithms: default_algorithms(),
        }
    }
}

/// Coordinator (Steward + Registry) settings
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Steward listener: agent updates and rule administration
    #[serde(default = "default_coordinator_addr")]
    pub steward_addr: String,

    /// Registry listener: the join handshake
    #[serde(default = "default_registry_addr")]
    pub registry_addr: String,

    #[serde(default = "default_tick")]
    pub tick_ms: u64,

    /// How long to keep calling a joining agent back
    #[serde(default = "default_reeve_timeout")]
    pub reeve_timeout_ms: u64,

    #[serde(default = "default_callback_retry")]
    pub callback_retry_ms: u64,

    /// JSON-lines rules seeded into an empty registry
    #[serde(default)]
    pub rules_file: Option<PathBuf>,

    #[serde(default = "default_algorithms")]
    pub allowed_algorithms: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            steward_addr: default_coordinator_addr(),
            registry_addr: default_registry_addr(),
            tick_ms: default_tick(),
            reeve_timeout_ms: default_reeve_timeout(),
            callback_retry_ms: default_callback_retry(),
            rules_file: None,
            allowed_algorithms: default_algorithms(),
        }
    }
}

// Default value functions
fn default_services() -> Vec<String> { vec!["agent".to_string()] }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_bloc() -> String { "Fleet".to_string() }
fn default_horde() -> String { "sharks".to_string() }
fn default_agent_addr() -> String { DEFAULT_AGENT_ADDR.to_string() }
fn default_coordinator_addr() -> String { DEFAULT_COORDINATOR_ADDR.to_string() }
fn default_registry_addr() -> String { DEFAULT_REGISTRY_ADDR.to_string() }
fn default_ping_delay() -> u64 { DEFAULT_PING_DELAY_MS }
fn default_ping_timeout() -> u64 { DEFAULT_PING_TIMEOUT_MS }
fn default_register_timeout() -> u64 { DEFAULT_REGISTER_TIMEOUT_MS }
fn default_forwarder_queue() -> usize { DEFAULT_FORWARDER_QUEUE }
fn default_tick() -> u64 { DEFAULT_TICK_MS }
fn default_reeve_timeout() -> u64 { DEFAULT_REEVE_TIMEOUT_MS }
fn default_callback_retry() -> u64 { DEFAULT_CALLBACK_RETRY_MS }
fn default_algorithms() -> Vec<String> { vec![ED25519_ALGORITHM.to_string()] }

fn generate_node_name() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

fn generate_principal() -> String {
    use rand::Rng;
    use rand::distr::Alphanumeric;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect()
}

impl AgentConfig {
    pub fn ping_delay(&self) -> Duration { Duration::from_millis(self.ping_delay_ms) }
    pub fn ping_timeout(&self) -> Duration { Duration::from_millis(self.ping_timeout_ms) }
    pub fn register_timeout(&self) -> Duration { Duration::from_millis(self.register_timeout_ms) }
}

impl CoordinatorConfig {
    pub fn tick(&self) -> Duration { Duration::from_millis(self.tick_ms) }
    pub fn reeve_timeout(&self) -> Duration { Duration::from_millis(self.reeve_timeout_ms) }
    pub fn callback_retry(&self) -> Duration { Duration::from_millis(self.callback_retry_ms) }
}

/// CLI values that override the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub services: Option<Vec<String>>,
    pub data_dir: Option<PathBuf>,
    pub agent_listen: Option<String>,
    pub registry_addr: Option<String>,
    pub steward_addr: Option<String>,
    pub horde: Option<String>,
}

impl AppConfig {
    /// Load configuration from file and `TETHER__*` environment variables, with CLI overrides
    pub fn load(config_path: &str, overrides: &Overrides) -> Result<Self> {
        let mut builder = config::Config::builder();
        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!("Config file not found, using defaults");
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("TETHER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("services")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load config file")?;
        let mut config: Self = settings.try_deserialize().context("Failed to parse config")?;

        // Apply CLI overrides
        if let Some(services) = &overrides.services {
            config.services = services.clone();
        }
        if let Some(data_dir) = &overrides.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(listen) = &overrides.agent_listen {
            config.agent.listen_addr = listen.clone();
        }
        if let Some(registry) = &overrides.registry_addr {
            config.agent.registry_addr = registry.clone();
            config.coordinator.registry_addr = registry.clone();
        }
        if let Some(steward) = &overrides.steward_addr {
            config.coordinator.steward_addr = steward.clone();
        }
        if let Some(horde) = &overrides.horde {
            config.identity.horde = horde.clone();
        }

        Ok(config)
    }

    /// The fleet's flock key, inline or from `flock_key_file`
    pub fn flock(&self) -> Result<FlockKey> {
        if let Some(text) = &self.flock_key {
            return Ok(FlockKey::parse(text)?);
        }
        let Some(path) = &self.flock_key_file else {
            bail!("no flock key configured (set flock_key or flock_key_file)");
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read flock key file {}", path.display()))?;
        Ok(FlockKey::parse(&text)?)
    }

    /// Configured principal, or the one kept under `data_dir`, generating it on first use
    pub fn principal(&self) -> Result<String> {
        if let Some(principal) = &self.identity.principal {
            return Ok(principal.clone());
        }
        let path = self.data_dir.join("principal");
        if path.exists() {
            let principal = std::fs::read_to_string(&path).context("Failed to read principal file")?;
            return Ok(principal.trim().to_string());
        }
        std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        let principal = generate_principal();
        std::fs::write(&path, &principal).context("Failed to write principal file")?;
        tracing::info!(principal = %principal, "Generated node principal");
        Ok(principal)
    }

    pub fn placement(&self) -> Result<Placement> {
        Ok(Placement {
            bloc: self.identity.bloc.clone(),
            horde: self.identity.horde.clone(),
            node: self.identity.node.clone(),
            principal: self.principal()?,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            data_dir: default_data_dir(),
            flock_key: None,
            flock_key_file: None,
            identity: IdentityConfig::default(),
            agent: AgentConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

/// Resolved node placement shared by the services on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub bloc: String,
    pub horde: String,
    pub node: String,
    pub principal: String,
}
