//! The agent (Reeve): local registrations, relay to the coordinator, and
//! the fleet view used to answer catalog queries.

pub mod fleet;
pub mod forwarder;
pub mod routes;
pub mod store;

pub(crate) use store::write_private_file;

use anyhow::{Context, Result};
use chrono::Utc;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_common::constants::{files, services};
use tether_common::ids::local_uuid;
use tether_common::{
    Ack, AckStatus, CatalogDelta, CatalogInfo, ClientData, EndpointData, EpDelta, KeyId,
    KeyStatus, NetId, NodeId, PubKey, ServiceState, TetherError, WlDelta,
};

use crate::config::Placement;
use crate::flock::FlockKey;
use crate::handshake::{CoordinatorSlot, JoinIdentity, JoinSettings, join_fleet};
use crate::rpc::{self, CoordinatorApi, HttpCoordinator, SignedClient};
use crate::signing::{KeyPair, SignatureAuthority, Whitelist, verifying_key};

use fleet::FleetCache;
use forwarder::{Forwarder, Relay, RelayOutcome};
use store::{RecordState, RecordStore};

/// Everything needed to start an agent
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub placement: Placement,
    pub listen_addr: String,
    pub registry_url: String,
    pub data_dir: PathBuf,
    pub ping_delay: Duration,
    pub ping_timeout: Duration,
    pub register_timeout: Duration,
    pub forwarder_queue: usize,
    pub allowed_algorithms: Vec<String>,
}

/// State shared by the agent's handlers
#[derive(Clone)]
pub struct AgentState {
    pub nodeid: NodeId,
    pub netid: NetId,
    pub keys: Arc<KeyPair>,
    pub authority: SignatureAuthority,
    pub coordinator: CoordinatorSlot,
    pub clients: Arc<RecordStore<ClientData>>,
    pub endpoints: Arc<RecordStore<EndpointData>>,
    pub fleet: Arc<FleetCache>,
    pub forwarder: Arc<Forwarder>,
}

fn done(local: &str, state: i64) -> Ack {
    let mut ack = Ack::new(AckStatus::Done);
    ack.localuuid = local.to_string();
    ack.state = state;
    ack
}

impl AgentState {
    pub fn whitelist(&self) -> &Whitelist {
        self.authority.whitelist()
    }

    /// The caller is this agent or a client registered through it
    pub async fn ensure_local(&self, signer: &KeyId) -> Result<(), TetherError> {
        if signer == self.keys.key_id() {
            return Ok(());
        }
        let local = local_uuid(&signer.to_string()).to_string();
        if self.clients.is_live(&local).await {
            return Ok(());
        }
        Err(TetherError::Unauthenticated(format!("{} is not a local client", signer)))
    }

    /// The caller is the coordinator this agent registered with
    pub async fn ensure_coordinator(&self, signer: &KeyId) -> Result<(), TetherError> {
        if self.coordinator.is_coordinator(signer).await {
            return Ok(());
        }
        Err(TetherError::Unauthenticated(format!("{} is not the coordinator", signer)))
    }

    /// Accept an endpoint registration and queue it for the coordinator
    pub async fn register_endpoint(&self, mut data: EndpointData) -> Result<Ack, TetherError> {
        let _: NodeId = data.nodeid.parse()?;
        let netid: NetId = data.netid.parse()?;
        if netid.query {
            return Err(TetherError::InvalidArgument(format!("netid {} is a query", data.netid)));
        }
        let local = local_uuid(&data.netid).to_string();
        if data.created_at.is_empty() {
            data.created_at = Utc::now().to_rfc3339();
        }

        if self.endpoints.state_of(&local).await == Some(RecordState::Completed)
            && data.status == ServiceState::Up
        {
            let mut ack = done(&local, 0);
            ack.remoteuuid = self.endpoints.remote_for(&local).await.unwrap_or_default();
            return Ok(ack);
        }
        if data.status == ServiceState::Down {
            // removal is relayed even for an already completed endpoint
            self.endpoints.record_failed(&local, None, data.clone()).await?;
        } else {
            self.endpoints.record_pending(&local, data.clone()).await?;
        }
        self.forwarder
            .send(Relay::Endpoint {
                local: local.clone(),
                data,
            })
            .await?;
        Ok(done(&local, 0))
    }

    /// Accept a client key, trust it locally and queue it for the coordinator
    pub async fn register_client(&self, data: ClientData) -> Result<Ack, TetherError> {
        let _: NodeId = data.nodeid.parse()?;
        let keyid: KeyId = data.keyid.parse()?;
        if keyid.is_query() {
            return Err(TetherError::InvalidArgument(format!("keyid {} is a query", data.keyid)));
        }
        let pk = PubKey::from_json(&data.keyjson)?;
        if pk.keyid != data.keyid {
            return Err(TetherError::InvalidArgument(
                "keyid string mismatch with json pubkey".into(),
            ));
        }
        verifying_key(&pk)?;
        let local = local_uuid(&data.keyid).to_string();

        if data.status == KeyStatus::Revoked {
            self.whitelist().remove(&data.keyid).await;
            self.clients.record_failed(&local, None, data.clone()).await?;
        } else {
            self.whitelist().add(&pk).await?;
            if self.clients.record_pending(&local, data.clone()).await? == RecordState::Completed {
                let mut ack = done(&local, 0);
                ack.remoteuuid = self.clients.remote_for(&local).await.unwrap_or_default();
                return Ok(ack);
            }
        }
        self.forwarder
            .send(Relay::Client {
                local: local.clone(),
                data,
            })
            .await?;
        Ok(done(&local, 0))
    }

    /// Install and drop fleet keys pushed by the coordinator
    pub async fn apply_wl_update(&self, delta: &WlDelta) -> Result<Ack, TetherError> {
        for raw in &delta.add {
            let result = match PubKey::from_json(raw) {
                Ok(mut pk) => {
                    pk.stateadded = delta.state;
                    self.whitelist().add(&pk).await.map(|_| ())
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(state = delta.state, error = %e, "Skipping pushed key");
            }
        }
        for raw in &delta.del {
            match PubKey::from_json(raw) {
                Ok(pk) if pk.keyid != self.keys.key_id().to_string() => {
                    self.whitelist().remove(&pk.keyid).await;
                }
                Ok(_) => {}
                Err(e) => warn!(state = delta.state, error = %e, "Skipping pushed key removal"),
            }
        }
        debug!(state = delta.state, add = delta.add.len(), del = delta.del.len(), "Applied WlUpdate");
        Ok(done("", delta.state))
    }

    pub async fn apply_ep_update(&self, delta: &EpDelta) -> Result<Ack, TetherError> {
        let (added, removed) = self.fleet.apply_ep_delta(delta).await;
        debug!(state = delta.state, added, removed, "Applied EpUpdate");
        Ok(done("", delta.state))
    }

    /// Replace the catalog and rules.
    ///
    /// Reeve and Steward entries are not taken from the push; this agent and
    /// its recorded coordinator are listed instead.
    pub async fn apply_catalog(&self, delta: CatalogDelta) -> Result<Ack, TetherError> {
        let mut list = Vec::with_capacity(delta.list.len() + 2);
        for entry in delta.list {
            let nodeid: NodeId = entry.nodeid.parse()?;
            let _: NetId = entry.netid.parse()?;
            if nodeid.service_name == services::REEVE || nodeid.service_name == services::STEWARD {
                continue;
            }
            list.push(entry);
        }
        list.push(CatalogInfo {
            nodeid: self.nodeid.to_string(),
            netid: self.netid.to_string(),
            filename: "n/a".to_string(),
        });
        if let Some(coordinator) = self.coordinator.get().await {
            list.push(CatalogInfo {
                nodeid: coordinator.nodeid,
                netid: coordinator.netid,
                filename: "n/a".to_string(),
            });
        }
        self.fleet.replace_catalog(list, delta.rules).await;
        Ok(done("", 0))
    }

    /// Re-queue every pending record; returns how many were queued
    pub async fn resync(&self) -> Result<usize, TetherError> {
        let mut queued = 0;
        for (local, data) in self.clients.pending().await {
            self.forwarder.send(Relay::Client { local, data }).await?;
            queued += 1;
        }
        for (local, data) in self.endpoints.pending().await {
            self.forwarder.send(Relay::Endpoint { local, data }).await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Register this agent's own Reeve endpoint and key
    pub async fn announce(&self) -> Result<(), TetherError> {
        self.register_endpoint(EndpointData {
            nodeid: self.nodeid.to_string(),
            netid: self.netid.to_string(),
            status: ServiceState::Up,
            ..Default::default()
        })
        .await?;
        self.register_client(ClientData {
            nodeid: self.nodeid.to_string(),
            keyid: self.keys.key_id().to_string(),
            keyjson: self.keys.pubkey_json()?,
            status: KeyStatus::Current,
        })
        .await?;
        Ok(())
    }
}

/// Apply relay outcomes to the record stores.
///
/// Rejections (bad argument, bad signature) fail the record, and a rejected
/// client key stops verifying here; anything else leaves the record pending
/// for the next resync.
async fn reconcile(
    clients: Arc<RecordStore<ClientData>>,
    endpoints: Arc<RecordStore<EndpointData>>,
    whitelist: Whitelist,
    own_key: KeyId,
    mut outcomes: mpsc::Receiver<RelayOutcome>,
) {
    while let Some(RelayOutcome { relay, result }) = outcomes.recv().await {
        let applied = match (relay, result) {
            (Relay::Client { local, data }, Ok(ack)) if ack.status != AckStatus::Fail && !ack.remoteuuid.is_empty() => {
                if data.status == KeyStatus::Revoked {
                    clients.record_failed(&local, Some(&ack.remoteuuid), data).await
                } else {
                    clients.record_completed(&local, &ack.remoteuuid, data).await
                }
            }
            (Relay::Endpoint { local, data }, Ok(ack)) if ack.status != AckStatus::Fail && !ack.remoteuuid.is_empty() => {
                if data.status == ServiceState::Down {
                    endpoints.record_failed(&local, Some(&ack.remoteuuid), data).await
                } else {
                    endpoints.record_completed(&local, &ack.remoteuuid, data).await
                }
            }
            (Relay::Client { local, data }, Err(e)) if e.is_rejection() => {
                warn!(local = %local, error = %e, "Coordinator rejected client");
                if data.keyid != own_key.to_string() {
                    whitelist.remove(&data.keyid).await;
                }
                clients.record_failed(&local, None, data).await
            }
            (Relay::Endpoint { local, data }, Err(e)) if e.is_rejection() => {
                warn!(local = %local, error = %e, "Coordinator rejected endpoint");
                endpoints.record_failed(&local, None, data).await
            }
            (relay, Ok(ack)) => {
                warn!(local = relay.local(), status = ?ack.status, "Relay not acknowledged, left pending");
                Ok(())
            }
            (relay, Err(e)) => {
                debug!(local = relay.local(), error = %e, "Relay failed, left pending");
                Ok(())
            }
        };
        if let Err(e) = applied {
            warn!(error = %e, "Failed to record relay outcome");
        }
    }
}

/// A running agent
pub struct Agent {
    state: AgentState,
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    server: JoinHandle<()>,
    reconciler: JoinHandle<()>,
}

impl Agent {
    /// Start with HTTP calls to the coordinator
    pub async fn start(settings: AgentSettings, keys: Arc<KeyPair>, flock: FlockKey) -> Result<Self> {
        Self::start_with(settings, keys, flock, None).await
    }

    /// Start, optionally relaying through `coordinator` instead of HTTP
    pub async fn start_with(
        settings: AgentSettings,
        keys: Arc<KeyPair>,
        flock: FlockKey,
        coordinator: Option<Arc<dyn CoordinatorApi>>,
    ) -> Result<Self> {
        let clients = Arc::new(RecordStore::<ClientData>::open(settings.data_dir.join("clients")).await?);
        let endpoints = Arc::new(RecordStore::open(settings.data_dir.join("endpoints")).await?);
        let slot = CoordinatorSlot::open(settings.data_dir.join(files::COORDINATOR)).await?;

        let whitelist = Whitelist::new();
        whitelist.add(keys.pubkey()).await?;
        if let Some(recorded) = slot.get().await {
            whitelist.add(&PubKey::from_json(&recorded.pubkey)?).await?;
        }
        let kept = clients.snapshot().await;
        for data in kept.pending.values().chain(kept.completed.values()) {
            let trusted = match PubKey::from_json(&data.keyjson) {
                Ok(pk) => whitelist.add(&pk).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = trusted {
                warn!(keyid = %data.keyid, error = %e, "Skipping stored client key");
            }
        }
        let authority = SignatureAuthority::new(whitelist.clone(), settings.allowed_algorithms.clone());

        let listener = TcpListener::bind(&settings.listen_addr)
            .await
            .with_context(|| format!("binding agent listener {}", settings.listen_addr))?;
        let addr = listener.local_addr()?;
        let p = &settings.placement;
        let nodeid = NodeId::new(&p.bloc, &p.horde, &p.node, services::REEVE, services::REEVE_API)?;
        let netid = NetId::from_address(services::REEVE_REV, &p.principal, &addr.to_string())?;

        let http = rpc::http_client(settings.register_timeout.max(Duration::from_secs(30)))?;
        let coordinator: Arc<dyn CoordinatorApi> = match coordinator {
            Some(coordinator) => coordinator,
            None => Arc::new(HttpCoordinator::new(
                SignedClient::new(http.clone(), keys.clone()),
                slot.clone(),
            )),
        };
        let (outcome_tx, outcome_rx) = mpsc::channel(settings.forwarder_queue.max(1));
        let forwarder = Arc::new(Forwarder::start(coordinator, settings.forwarder_queue, outcome_tx));
        let reconciler = tokio::spawn(reconcile(
            clients.clone(),
            endpoints.clone(),
            whitelist.clone(),
            keys.key_id().clone(),
            outcome_rx,
        ));

        let state = AgentState {
            nodeid: nodeid.clone(),
            netid: netid.clone(),
            keys: keys.clone(),
            authority,
            coordinator: slot.clone(),
            clients,
            endpoints,
            fleet: Arc::new(FleetCache::new()),
            forwarder,
        };

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let server = crate::coordinator::serve(listener, routes::agent_router(state.clone()), shutdown_tx.subscribe());
        info!(addr = %addr, netid = %netid, "🚀 Agent listening");

        let agent = Self {
            state,
            addr,
            shutdown_tx,
            server,
            reconciler,
        };
        if let Err(e) = agent.join(&settings, &http, &flock).await {
            agent.shutdown().await;
            return Err(e);
        }
        Ok(agent)
    }

    async fn join(&self, settings: &AgentSettings, http: &reqwest::Client, flock: &FlockKey) -> Result<()> {
        let state = &self.state;
        match state.coordinator.get().await {
            Some(recorded) => {
                let url = recorded.netid.parse::<NetId>()?.http_url();
                info!(coordinator = %recorded.netid, "Using recorded coordinator");
                rpc::ping_sleep(http, &url, settings.ping_delay, settings.ping_timeout).await?;
            }
            None => {
                let join = JoinSettings {
                    registry_url: settings.registry_url.clone(),
                    ping_delay: settings.ping_delay,
                    ping_timeout: settings.ping_timeout,
                    register_timeout: settings.register_timeout,
                };
                let me = JoinIdentity {
                    nodeid: state.nodeid.clone(),
                    netid: state.netid.clone(),
                    pubkey: state.keys.pubkey().clone(),
                };
                join_fleet(http, flock, &join, &me, state.whitelist(), &state.coordinator)
                    .await
                    .context("registering with coordinator")?;
            }
        }

        let queued = state.resync().await?;
        if queued > 0 {
            info!(queued, "Re-queued pending records");
        }
        state.announce().await?;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Stop relaying, then the listener; pending records stay on disk
    pub async fn shutdown(self) {
        self.state.forwarder.stop().await;
        let _ = self.shutdown_tx.send(());
        let _ = self.server.await;
        drop(self.state);
        let _ = self.reconciler.await;
        info!("👋 Agent shutdown complete");
    }
}
