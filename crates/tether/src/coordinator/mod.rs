//! The coordinator: Registry (join handshake) and Steward (fleet state).
//!
//! ```text
//! agents ──signed──▶ Steward routes ──▶ Ingest ──tick──▶ RegistryDb
//!                                                     │
//!                                                     └──▶ Fanout ──signed──▶ agents
//! ```

pub mod fanout;
pub mod ingest;
pub mod registry_db;
pub mod routes;
pub mod rules;
pub mod tick;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tether_common::constants::{FIRST_STATE, services};
use tether_common::{KeyId, KeyStatus, NetId, NodeId, PubKey, RuleInfo, ServiceState, TetherError};

use crate::config::Placement;
use crate::flock::FlockKey;
use crate::handshake::{AdmissionLedger, CoordinatorIdentity, HandshakeServer, registry_router};
use crate::rpc::{AgentApi, HttpAgents, SignedClient};
use crate::signing::{KeyPair, SignatureAuthority, Whitelist};

use fanout::{Fanout, FanoutHandle, FanoutRequest};
use ingest::{Ingest, IngestRecord, IntervalSink, StateClock};
use registry_db::{ClientRow, EndpointRow, RegistryDb, make_client_row, make_endpoint_row};

/// Everything needed to start a coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub placement: Placement,
    pub steward_addr: String,
    pub registry_addr: String,
    /// Registry database file; in memory when unset
    pub db_path: Option<PathBuf>,
    pub tick: Duration,
    pub reeve_timeout: Duration,
    pub callback_retry: Duration,
    pub allowed_algorithms: Vec<String>,
    pub rules: Vec<RuleInfo>,
}

/// Counts from persisting one interval
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub endpoints: usize,
    pub clients: usize,
    pub removed: usize,
    pub duplicates: usize,
    pub bad: usize,
}

fn flush_endpoints(db: &RegistryDb, rows: &mut Vec<EndpointRow>, state: i64, summary: &mut BatchSummary) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let written = db.insert_endpoints(rows, state)?;
    rows.clear();
    summary.endpoints += written.inserted;
    summary.duplicates += written.duplicates;
    Ok(())
}

fn flush_clients(db: &RegistryDb, rows: &mut Vec<ClientRow>, state: i64, summary: &mut BatchSummary) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let written = db.insert_clients(rows, state)?;
    rows.clear();
    summary.clients += written.inserted;
    summary.duplicates += written.duplicates;
    Ok(())
}

/// Write one closed interval to the registry.
///
/// Records that fail validation are logged to `badrequest` and skipped; the
/// rest of the batch is still written. Rows queued before a removal are
/// written before it, so the last record for an identity decides whether it
/// ends the interval live.
pub fn persist_batch(db: &RegistryDb, batch: Vec<IngestRecord>, clock: &StateClock) -> Result<BatchSummary> {
    let state = clock.state;
    let mut summary = BatchSummary::default();
    let mut endpoints = Vec::new();
    let mut clients = Vec::new();

    for record in batch {
        let checked: Result<(), TetherError> = match &record {
            IngestRecord::Endpoint { data, .. } if data.status == ServiceState::Down => {
                match data.nodeid.parse::<NodeId>().and_then(|_| data.netid.parse::<NetId>()) {
                    Ok(_) => {
                        flush_endpoints(db, &mut endpoints, state, &mut summary)?;
                        summary.removed += db.remove_endpoint(&data.nodeid, &data.netid, state)?;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            IngestRecord::Endpoint { data, .. } => make_endpoint_row(data).map(|row| endpoints.push(row)),
            IngestRecord::Client { data, .. } if data.status == KeyStatus::Revoked => {
                match data.keyid.parse::<KeyId>() {
                    Ok(_) => {
                        flush_clients(db, &mut clients, state, &mut summary)?;
                        summary.removed += db.remove_client(&data.keyid, state)?;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            IngestRecord::Client { data, .. } => make_client_row(data).map(|row| clients.push(row)),
        };
        if let Err(e) = checked {
            summary.bad += 1;
            warn!(tx = record.tx_uuid(), signer = %record.signer(), error = %e, "Bad request");
            db.mark_bad_request(record.tx_uuid(), &record.signer().to_string(), state, &e.to_string())?;
        }
    }

    flush_endpoints(db, &mut endpoints, state, &mut summary)?;
    flush_clients(db, &mut clients, state, &mut summary)?;
    db.mark_state_time(clock)?;
    Ok(summary)
}

/// Persists each interval, then hands its clock to Fanout
struct RegistrySink {
    db: Arc<RegistryDb>,
    fanout: Arc<FanoutHandle>,
}

#[async_trait]
impl IntervalSink for RegistrySink {
    async fn persist(&self, batch: Vec<IngestRecord>, clock: StateClock) -> Result<()> {
        let db = self.db.clone();
        let closed = clock.clone();
        let summary = tokio::task::spawn_blocking(move || persist_batch(&db, batch, &closed))
            .await
            .context("persist task failed")??;
        info!(state = clock.state, ?summary, "💾 Interval persisted");
        self.fanout.request(FanoutRequest::Tick(clock)).await?;
        Ok(())
    }
}

impl AdmissionLedger for RegistryDb {
    fn admit(&self, nodeid: &NodeId, netid: &NetId, pubkey: &PubKey) -> Result<(), TetherError> {
        self.admit_agent(nodeid, netid, pubkey)
            .map_err(|e| TetherError::Storage(e.to_string()))
    }
}

/// Trust again the agents this registry already knows
async fn restore_agent_keys(db: &RegistryDb, whitelist: &Whitelist) -> Result<usize> {
    let mut restored = 0;
    for raw in db.trusted_agent_keys()? {
        match PubKey::from_json(&raw) {
            Ok(pk) => match whitelist.add(&pk).await {
                Ok(_) => restored += 1,
                Err(e) => warn!(keyid = %pk.keyid, error = %e, "Skipping stored agent key"),
            },
            Err(e) => warn!(error = %e, "Skipping unreadable agent key"),
        }
    }
    if restored > 0 {
        info!(restored, "Restored trusted agent keys");
    }
    Ok(restored)
}

/// State shared by the Steward handlers
#[derive(Clone)]
pub struct StewardState {
    pub db: Arc<RegistryDb>,
    pub ingest: Arc<Ingest>,
    pub fanout: Arc<FanoutHandle>,
    pub authority: SignatureAuthority,
    /// Principal allowed to administer rules
    pub admin_principal: String,
}

impl StewardState {
    pub async fn add_rule(&self, rule: &RuleInfo) -> Result<(), TetherError> {
        self.db
            .add_rule(rule)
            .map_err(|e| TetherError::Storage(e.to_string()))?;
        info!(rule = %rule.rule, horde = %rule.horde, from = %rule.from, to = %rule.to, "Rule added");
        self.fanout.request(FanoutRequest::Refresh).await
    }

    pub async fn remove_rule(&self, rule: &str, horde: &str) -> Result<usize, TetherError> {
        let removed = self
            .db
            .remove_rule(rule, horde)
            .map_err(|e| TetherError::Storage(e.to_string()))?;
        if removed == 0 {
            return Err(TetherError::NotFound(format!("rule {} in horde {}", rule, horde)));
        }
        info!(rule, horde, "Rule removed");
        self.fanout.request(FanoutRequest::Refresh).await?;
        Ok(removed)
    }
}

/// A running coordinator
pub struct Coordinator {
    state: StewardState,
    identity: CoordinatorIdentity,
    steward_addr: SocketAddr,
    registry_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    servers: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Start with HTTP calls to agents
    pub async fn start(settings: CoordinatorSettings, keys: Arc<KeyPair>, flock: FlockKey) -> Result<Self> {
        let http = crate::rpc::http_client(Duration::from_secs(10))?;
        let agents: Arc<dyn AgentApi> = Arc::new(HttpAgents::new(SignedClient::new(http, keys.clone())));
        Self::start_with(settings, keys, flock, agents).await
    }

    pub async fn start_with(
        settings: CoordinatorSettings,
        keys: Arc<KeyPair>,
        flock: FlockKey,
        agents: Arc<dyn AgentApi>,
    ) -> Result<Self> {
        let db = Arc::new(match &settings.db_path {
            Some(path) => RegistryDb::open(path)?,
            None => RegistryDb::open_in_memory()?,
        });
        db.seed_rules(&settings.rules)?;
        let first_state = db.last_state()?.map(|s| s + 1).unwrap_or(FIRST_STATE);

        let steward_listener = TcpListener::bind(&settings.steward_addr)
            .await
            .with_context(|| format!("binding steward listener {}", settings.steward_addr))?;
        let registry_listener = TcpListener::bind(&settings.registry_addr)
            .await
            .with_context(|| format!("binding registry listener {}", settings.registry_addr))?;
        let steward_addr = steward_listener.local_addr()?;
        let registry_addr = registry_listener.local_addr()?;

        let p = &settings.placement;
        let nodeid = NodeId::new(&p.bloc, &p.horde, &p.node, services::STEWARD, services::STEWARD_API)?;
        let netid = NetId::from_address(services::STEWARD_REV, &p.principal, &steward_addr.to_string())?;
        let identity = CoordinatorIdentity {
            nodeid: nodeid.to_string(),
            netid: netid.to_string(),
            keyid: keys.key_id().to_string(),
            pubkey: keys.pubkey_json()?,
        };

        let whitelist = Whitelist::new();
        whitelist.add(keys.pubkey()).await?;
        restore_agent_keys(&db, &whitelist).await?;
        let authority = SignatureAuthority::new(whitelist.clone(), settings.allowed_algorithms.clone());

        let fanout = Arc::new(FanoutHandle::spawn(Fanout::new(db.clone(), agents)));
        let sink = Arc::new(RegistrySink {
            db: db.clone(),
            fanout: fanout.clone(),
        });
        let ingest = Arc::new(Ingest::start(settings.tick, first_state, sink));

        let state = StewardState {
            db,
            ingest,
            fanout,
            authority,
            admin_principal: p.principal.clone(),
        };

        let ledger: Arc<dyn AdmissionLedger> = state.db.clone();
        let callback_http = crate::rpc::http_client(settings.reeve_timeout)?;
        let handshake = HandshakeServer::new(
            flock,
            identity.clone(),
            SignedClient::new(callback_http, keys.clone()),
            whitelist,
            ledger,
            settings.reeve_timeout,
            settings.callback_retry,
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let servers = vec![
            serve(steward_listener, routes::steward_router(state.clone()), shutdown_tx.subscribe()),
            serve(registry_listener, registry_router(handshake), shutdown_tx.subscribe()),
        ];
        info!(steward = %steward_addr, registry = %registry_addr, netid = %identity.netid, "🚀 Coordinator listening");

        Ok(Self {
            state,
            identity,
            steward_addr,
            registry_addr,
            shutdown_tx,
            servers,
        })
    }

    pub fn identity(&self) -> &CoordinatorIdentity {
        &self.identity
    }

    pub fn steward_addr(&self) -> SocketAddr {
        self.steward_addr
    }

    pub fn registry_addr(&self) -> SocketAddr {
        self.registry_addr
    }

    pub fn state(&self) -> &StewardState {
        &self.state
    }

    /// Stop the listeners, then fanout, then ingest; the database closes last
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for server in self.servers {
            let _ = server.await;
        }
        self.state.fanout.stop().await;
        self.state.ingest.stop().await;
        info!("👋 Coordinator shutdown complete");
    }
}

/// Serve `router` on `listener` until shutdown is broadcast
pub(crate) fn serve(
    listener: TcpListener,
    router: axum::Router,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server error");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::registry_db::tests::{client, endpoint};

    fn signer() -> KeyId {
        KeyPair::generate("Reeve1", "P").unwrap().key_id().clone()
    }

    #[test]
    fn test_persist_batch_logs_bad_records() {
        let db = RegistryDb::open_in_memory().unwrap();
        let mut good = endpoint("sharks", "Pastiche", "P", 7000);
        good.hash = "abc".into();
        let mut bad = endpoint("sharks", "Pastiche", "P", 7001);
        bad.netid = "not a netid".into();
        let (cl, _) = client("sharks", "Viewer", "P");

        let batch = vec![
            IngestRecord::Endpoint { tx_uuid: "t1".into(), signer: signer(), data: good },
            IngestRecord::Endpoint { tx_uuid: "t2".into(), signer: signer(), data: bad },
            IngestRecord::Client { tx_uuid: "t3".into(), signer: signer(), data: cl },
        ];
        let clock = StateClock { state: 1, begin: None, end: None };
        let summary = persist_batch(&db, batch, &clock).unwrap();

        assert_eq!(summary.endpoints, 1);
        assert_eq!(summary.clients, 1);
        assert_eq!(summary.bad, 1);
        let bad = db.bad_requests().unwrap();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].0, "t2");
        assert_eq!(bad[0].1, 1);
    }

    #[test]
    fn test_down_and_revoked_remove_rows() {
        let db = RegistryDb::open_in_memory().unwrap();
        let ep = endpoint("sharks", "Pastiche", "P", 7000);
        let (cl, _) = client("sharks", "Viewer", "P");
        let first = vec![
            IngestRecord::Endpoint { tx_uuid: "a".into(), signer: signer(), data: ep.clone() },
            IngestRecord::Client { tx_uuid: "b".into(), signer: signer(), data: cl.clone() },
        ];
        persist_batch(&db, first, &StateClock { state: 1, begin: None, end: None }).unwrap();

        let mut down = ep;
        down.status = ServiceState::Down;
        let mut revoked = cl;
        revoked.status = KeyStatus::Revoked;
        let second = vec![
            IngestRecord::Endpoint { tx_uuid: "c".into(), signer: signer(), data: down },
            IngestRecord::Client { tx_uuid: "d".into(), signer: signer(), data: revoked },
        ];
        let summary = persist_batch(&db, second, &StateClock { state: 2, begin: None, end: None }).unwrap();
        assert_eq!(summary.removed, 2);
        assert_eq!(db.count_live_endpoints().unwrap(), 0);
        assert_eq!(db.count_live_clients().unwrap(), 0);
    }

    #[test]
    fn test_removal_after_insert_in_one_interval_wins() {
        let db = RegistryDb::open_in_memory().unwrap();
        let up = endpoint("sharks", "Pastiche", "P", 7000);
        let mut down = up.clone();
        down.status = ServiceState::Down;
        let (current, _) = client("sharks", "Viewer", "P");
        let mut revoked = current.clone();
        revoked.status = KeyStatus::Revoked;

        let batch = vec![
            IngestRecord::Endpoint { tx_uuid: "a".into(), signer: signer(), data: up },
            IngestRecord::Client { tx_uuid: "b".into(), signer: signer(), data: current },
            IngestRecord::Endpoint { tx_uuid: "c".into(), signer: signer(), data: down },
            IngestRecord::Client { tx_uuid: "d".into(), signer: signer(), data: revoked },
        ];
        let summary = persist_batch(&db, batch, &StateClock { state: 1, begin: None, end: None }).unwrap();
        assert_eq!(summary.endpoints, 1);
        assert_eq!(summary.clients, 1);
        assert_eq!(summary.removed, 2);
        assert_eq!(db.count_live_endpoints().unwrap(), 0);
        assert_eq!(db.count_live_clients().unwrap(), 0);
    }

    #[test]
    fn test_insert_after_removal_in_one_interval_wins() {
        let db = RegistryDb::open_in_memory().unwrap();
        let up = endpoint("sharks", "Pastiche", "P", 7000);
        let first = vec![IngestRecord::Endpoint { tx_uuid: "a".into(), signer: signer(), data: up.clone() }];
        persist_batch(&db, first, &StateClock { state: 1, begin: None, end: None }).unwrap();

        let mut down = up.clone();
        down.status = ServiceState::Down;
        let second = vec![
            IngestRecord::Endpoint { tx_uuid: "b".into(), signer: signer(), data: down },
            IngestRecord::Endpoint { tx_uuid: "c".into(), signer: signer(), data: up },
        ];
        let summary = persist_batch(&db, second, &StateClock { state: 2, begin: None, end: None }).unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.endpoints, 1);
        assert_eq!(db.count_live_endpoints().unwrap(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_sink_persists_then_requests_fanout() {
        use crate::coordinator::fanout::tests::RecordingAgents;

        let db = Arc::new(RegistryDb::open_in_memory().unwrap());
        let fanout = Arc::new(FanoutHandle::spawn(Fanout::new(db.clone(), Arc::new(RecordingAgents::default()))));
        let sink = RegistrySink {
            db: db.clone(),
            fanout: fanout.clone(),
        };
        let batch = vec![IngestRecord::Endpoint {
            tx_uuid: "a".into(),
            signer: signer(),
            data: endpoint("sharks", "Pastiche", "P", 7000),
        }];
        sink.persist(batch, StateClock { state: 3, begin: None, end: None }).await.unwrap();
        assert_eq!(db.count_live_endpoints().unwrap(), 1);
        assert_eq!(db.last_state().unwrap(), Some(3));
        fanout.stop().await;
    }

    #[tokio::test]
    async fn test_restored_keys_include_admitted_agents() {
        let db = RegistryDb::open_in_memory().unwrap();
        let joiner = KeyPair::generate(services::REEVE_REV, "PJ").unwrap();
        let nodeid: NodeId = "/Fleet/sharks/nodeJ/Reeve/ReeveAPI".parse().unwrap();
        let netid: NetId = "/Reeve1/PJ/net/127.0.0.1:50059".parse().unwrap();
        AdmissionLedger::admit(&db, &nodeid, &netid, joiner.pubkey()).unwrap();

        let whitelist = Whitelist::new();
        assert_eq!(restore_agent_keys(&db, &whitelist).await.unwrap(), 1);
        assert!(whitelist.contains(&joiner.key_id().to_string()).await);
    }
}
