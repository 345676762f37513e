//! Pushes per-tick visibility deltas to every Reeve.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_common::{CatalogDelta, EpDelta, RuleInfo, TetherError, WlDelta};

use super::ingest::StateClock;
use super::registry_db::{CatalogEntry, RegistryDb, ReeveTarget};
use super::tick::{ReeveBundle, TickUpdates};
use crate::rpc::AgentApi;

#[derive(Debug, Clone)]
pub enum FanoutRequest {
    /// Deltas for a persisted interval
    Tick(StateClock),
    /// Catalog and rules only, after a rule change
    Refresh,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub reeves: usize,
    pub pushes: usize,
    pub failures: usize,
}

pub struct Fanout {
    db: Arc<RegistryDb>,
    agents: Arc<dyn AgentApi>,
}

impl Fanout {
    pub fn new(db: Arc<RegistryDb>, agents: Arc<dyn AgentApi>) -> Self {
        Self { db, agents }
    }

    /// Push the deltas of `clock` to every live Reeve
    pub async fn fan_out(&self, clock: &StateClock) -> Result<FanoutReport> {
        let updates = self.db.update_on_tick(clock.state)?;
        self.push_all(clock.state, Some(&updates)).await
    }

    /// Push the current catalog and rules to every live Reeve
    pub async fn refresh(&self) -> Result<FanoutReport> {
        self.push_all(0, None).await
    }

    async fn push_all(&self, state: i64, updates: Option<&TickUpdates>) -> Result<FanoutReport> {
        let catalog = self.db.gather_catalog()?;
        let rules = self.db.rules()?;
        let reeves = self.db.gather_reeves()?;

        let mut report = FanoutReport {
            reeves: reeves.len(),
            ..Default::default()
        };
        for reeve in &reeves {
            let bundle = updates.map(|u| u.bundle_for(&reeve.netid.principal));
            self.push(reeve, state, bundle, &catalog, &rules, &mut report).await;
        }
        info!(state, ?report, "📣 Fanout complete");
        Ok(report)
    }

    async fn push(
        &self,
        reeve: &ReeveTarget,
        state: i64,
        bundle: Option<ReeveBundle>,
        catalog: &[CatalogEntry],
        rules: &[RuleInfo],
        report: &mut FanoutReport,
    ) {
        let horde = &reeve.nodeid.horde;
        let mut outcome = |what: &str, result: Result<(), TetherError>| {
            report.pushes += 1;
            if let Err(e) = result {
                report.failures += 1;
                warn!(reeve = %reeve.netid, what, error = %e, "Fanout push failed");
            }
        };

        if let Some(bundle) = bundle {
            if !bundle.add_epinfo.is_empty() || !bundle.del_epinfo.is_empty() {
                let delta = EpDelta {
                    state,
                    add: bundle.add_epinfo,
                    del: bundle.del_epinfo,
                };
                let result = self.agents.ep_update(&reeve.netid, &delta).await.map(|_| ());
                outcome("EpUpdate", result);
            }
            if !bundle.add_keys.is_empty() || !bundle.del_keys.is_empty() {
                let delta = WlDelta {
                    state,
                    add: bundle.add_keys,
                    del: bundle.del_keys,
                };
                let result = self.agents.wl_update(&reeve.netid, &delta).await.map(|_| ());
                outcome("WlUpdate", result);
            }
        }

        let delta = CatalogDelta {
            list: catalog
                .iter()
                .filter(|c| &c.horde == horde)
                .map(|c| c.info.clone())
                .collect(),
            rules: rules.iter().filter(|r| &r.horde == horde).cloned().collect(),
        };
        let result = self.agents.update_catalog(&reeve.netid, &delta).await.map(|_| ());
        outcome("UpdateCatalog", result);
        debug!(reeve = %reeve.netid, "Pushed deltas");
    }
}

/// Runs `Fanout` on its own task, one request at a time
pub struct FanoutHandle {
    tx: mpsc::Sender<FanoutRequest>,
    stop_tx: mpsc::Sender<()>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FanoutHandle {
    pub fn spawn(fanout: Fanout) -> Self {
        let (tx, mut rx) = mpsc::channel::<FanoutRequest>(1);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    request = rx.recv() => {
                        let Some(request) = request else { break };
                        let result = match &request {
                            FanoutRequest::Tick(clock) => fanout.fan_out(clock).await,
                            FanoutRequest::Refresh => fanout.refresh().await,
                        };
                        if let Err(e) = result {
                            warn!(?request, error = %e, "Fanout failed");
                        }
                    }
                }
            }
            info!("🛑 Fanout stopped");
        });

        Self {
            tx,
            stop_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Hand a request to the fanout task, waiting while it is busy
    pub async fn request(&self, request: FanoutRequest) -> Result<(), TetherError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| TetherError::FailedPrecondition("fanout is stopped".into()))
    }

    /// Stop after any in-flight fanout completes
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coordinator::registry_db::tests::{client, endpoint};
    use crate::coordinator::registry_db::{make_client_row, make_endpoint_row};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tether_common::{Ack, AckStatus, EpInfo, NetId};
    use tokio::sync::Mutex;

    /// Records every push, keyed by Reeve principal
    #[derive(Default)]
    pub(crate) struct RecordingAgents {
        pub wl: Mutex<HashMap<String, Vec<WlDelta>>>,
        pub ep: Mutex<HashMap<String, Vec<EpDelta>>>,
        pub catalog: Mutex<HashMap<String, Vec<CatalogDelta>>>,
        pub fail_principal: Option<String>,
    }

    impl RecordingAgents {
        fn check(&self, reeve: &NetId) -> Result<Ack, TetherError> {
            if self.fail_principal.as_deref() == Some(reeve.principal.as_str()) {
                return Err(TetherError::Unavailable("connection refused".into()));
            }
            Ok(Ack::new(AckStatus::Done))
        }
    }

    #[async_trait]
    impl AgentApi for RecordingAgents {
        async fn wl_update(&self, reeve: &NetId, delta: &WlDelta) -> Result<Ack, TetherError> {
            self.wl.lock().await.entry(reeve.principal.clone()).or_default().push(delta.clone());
            self.check(reeve)
        }

        async fn ep_update(&self, reeve: &NetId, delta: &EpDelta) -> Result<Ack, TetherError> {
            self.ep.lock().await.entry(reeve.principal.clone()).or_default().push(delta.clone());
            self.check(reeve)
        }

        async fn update_catalog(&self, reeve: &NetId, delta: &CatalogDelta) -> Result<Ack, TetherError> {
            self.catalog
                .lock()
                .await
                .entry(reeve.principal.clone())
                .or_default()
                .push(delta.clone());
            self.check(reeve)
        }
    }

    fn rule(horde: &str, from: &str, to: &str) -> RuleInfo {
        RuleInfo {
            rule: "1".into(),
            horde: horde.into(),
            from: from.into(),
            to: to.into(),
            owner: "admin".into(),
        }
    }

    fn clock(state: i64) -> StateClock {
        StateClock {
            state,
            begin: None,
            end: None,
        }
    }

    /// S serves Pastiche, C is a Viewer client, J is a Reeve in another horde
    fn fleet() -> Arc<RegistryDb> {
        let db = Arc::new(RegistryDb::open_in_memory().unwrap());
        db.add_rule(&rule("sharks", "Viewer", "Pastiche")).unwrap();
        db.add_rule(&rule("jets", "Viewer", "Pastiche")).unwrap();
        let reeves = [
            make_endpoint_row(&endpoint("sharks", "Reeve", "S", 50059)).unwrap(),
            make_endpoint_row(&endpoint("sharks", "Reeve", "C", 50069)).unwrap(),
            make_endpoint_row(&endpoint("jets", "Reeve", "J", 50079)).unwrap(),
        ];
        db.insert_endpoints(&reeves, 1).unwrap();
        db
    }

    #[tokio::test]
    async fn test_each_reeve_gets_exactly_its_deltas() {
        let db = fleet();
        let ep = endpoint("sharks", "Pastiche", "S", 7000);
        db.insert_endpoints(&[make_endpoint_row(&ep).unwrap()], 2).unwrap();
        let (cl, _) = client("sharks", "Viewer", "C");
        db.insert_clients(&[make_client_row(&cl).unwrap()], 2).unwrap();

        let agents = Arc::new(RecordingAgents::default());
        let report = Fanout::new(db, agents.clone()).fan_out(&clock(2)).await.unwrap();
        assert_eq!(report.reeves, 3);
        assert_eq!(report.failures, 0);

        let ep_pushes = agents.ep.lock().await;
        assert_eq!(
            ep_pushes["C"][0].add,
            vec![EpInfo {
                nodeid: ep.nodeid.clone(),
                netid: ep.netid.clone()
            }]
        );
        assert!(!ep_pushes.contains_key("S"));
        assert!(!ep_pushes.contains_key("J"));

        let wl_pushes = agents.wl.lock().await;
        assert_eq!(wl_pushes["S"][0].add, vec![cl.keyjson.clone()]);
        assert!(!wl_pushes.contains_key("C"));

        let catalogs = agents.catalog.lock().await;
        assert_eq!(catalogs.len(), 3);
        assert!(catalogs["J"][0].list.iter().all(|c| c.nodeid.contains("/jets/")));
        assert!(catalogs["J"][0].rules.iter().all(|r| r.horde == "jets"));
        assert!(catalogs["C"][0].list.iter().any(|c| c.netid == ep.netid));
    }

    #[tokio::test]
    async fn test_add_and_delete_never_overlap() {
        let db = fleet();
        let eps: Vec<_> = (7000..7004).map(|p| endpoint("sharks", "Pastiche", "S", p)).collect();
        let rows: Vec<_> = eps.iter().map(|e| make_endpoint_row(e).unwrap()).collect();
        db.insert_endpoints(&rows, 2).unwrap();
        let (cl, _) = client("sharks", "Viewer", "C");
        db.insert_clients(&[make_client_row(&cl).unwrap()], 2).unwrap();

        db.remove_endpoint(&eps[0].nodeid, &eps[0].netid, 3).unwrap();
        db.insert_endpoints(&[make_endpoint_row(&endpoint("sharks", "Pastiche", "S", 7010)).unwrap()], 3)
            .unwrap();

        let agents = Arc::new(RecordingAgents::default());
        Fanout::new(db, agents.clone()).fan_out(&clock(3)).await.unwrap();

        let ep_pushes = agents.ep.lock().await;
        let delta = &ep_pushes["C"][0];
        assert_eq!(delta.add.len(), 1);
        assert_eq!(delta.del.len(), 1);
        assert!(delta.add.iter().all(|a| !delta.del.contains(a)));
    }

    #[tokio::test]
    async fn test_failed_reeve_does_not_stop_others() {
        let db = fleet();
        let (cl, _) = client("sharks", "Viewer", "C");
        db.insert_clients(&[make_client_row(&cl).unwrap()], 2).unwrap();

        let agents = Arc::new(RecordingAgents {
            fail_principal: Some("C".into()),
            ..Default::default()
        });
        let report = Fanout::new(db, agents.clone()).fan_out(&clock(2)).await.unwrap();
        assert!(report.failures >= 1);
        assert_eq!(agents.catalog.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_pushes_catalog_only() {
        let db = fleet();
        let agents = Arc::new(RecordingAgents::default());
        let report = Fanout::new(db, agents.clone()).refresh().await.unwrap();
        assert_eq!(report.pushes, 3);
        assert!(agents.ep.lock().await.is_empty());
        assert!(agents.wl.lock().await.is_empty());
    }
}
