//! The agent's view of the fleet, kept current by coordinator pushes.

use std::collections::BTreeMap;
use tokio::sync::RwLock;

use tether_common::visibility::{Diagnostics, can_see};
use tether_common::{CatalogInfo, EndpointEntry, EpDelta, EpInfo, NodeId, RuleInfo, TetherError};

#[derive(Debug, Default)]
struct FleetState {
    /// Known endpoints and the StateClock they arrived in
    endpoints: BTreeMap<EpInfo, i64>,
    catalog: Vec<CatalogInfo>,
    rules: Vec<RuleInfo>,
    last_state: i64,
}

#[derive(Debug, Default)]
pub struct FleetCache {
    inner: RwLock<FleetState>,
}

/// Entries of `items` whose service `viewer` may see, or the diagnostic
fn visible<T: Clone>(
    viewer: &NodeId,
    rules: &[RuleInfo],
    items: impl Iterator<Item = (String, T)>,
) -> (Vec<T>, Diagnostics) {
    let mut diagnostics = Diagnostics::default();
    let mut out = Vec::new();
    for (nodeid, item) in items {
        let Ok(entry) = nodeid.parse::<NodeId>() else {
            continue;
        };
        let verdict = can_see(viewer, &entry.service_name, rules);
        if verdict.visible {
            out.push(item);
        } else {
            diagnostics.merge(verdict.diagnostics);
        }
    }
    (out, diagnostics)
}

impl FleetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an endpoint delta; returns (added, removed)
    pub async fn apply_ep_delta(&self, delta: &EpDelta) -> (usize, usize) {
        let mut fleet = self.inner.write().await;
        let mut removed = 0;
        for info in &delta.del {
            if fleet.endpoints.remove(info).is_some() {
                removed += 1;
            }
        }
        let mut added = 0;
        for info in &delta.add {
            if fleet.endpoints.insert(info.clone(), delta.state).is_none() {
                added += 1;
            }
        }
        fleet.last_state = fleet.last_state.max(delta.state);
        (added, removed)
    }

    pub async fn replace_catalog(&self, list: Vec<CatalogInfo>, rules: Vec<RuleInfo>) {
        let mut fleet = self.inner.write().await;
        fleet.catalog = list;
        fleet.rules = rules;
    }

    pub async fn rules(&self) -> Vec<RuleInfo> {
        self.inner.read().await.rules.clone()
    }

    pub async fn catalog(&self) -> Vec<CatalogInfo> {
        self.inner.read().await.catalog.clone()
    }

    pub async fn last_state(&self) -> i64 {
        self.inner.read().await.last_state
    }

    /// Catalog entries `viewer` may see
    pub async fn catalog_for(&self, viewer: &NodeId) -> Result<Vec<CatalogInfo>, TetherError> {
        let fleet = self.inner.read().await;
        let items = fleet.catalog.iter().map(|c| (c.nodeid.clone(), c.clone()));
        let (list, diagnostics) = visible(viewer, &fleet.rules, items);
        if list.is_empty() {
            return Err(TetherError::InvalidArgument(diagnostics.message("catalog", viewer)));
        }
        Ok(list)
    }

    /// Known endpoints `viewer` may reach, at most `limit` (0 for all)
    pub async fn endpoints_up(&self, viewer: &NodeId, limit: usize) -> Result<Vec<EndpointEntry>, TetherError> {
        let fleet = self.inner.read().await;
        let items = fleet.endpoints.iter().map(|(info, state)| {
            let entry = EndpointEntry {
                nodeid: info.nodeid.clone(),
                netid: info.netid.clone(),
                stateadded: *state,
            };
            (info.nodeid.clone(), entry)
        });
        let (mut list, diagnostics) = visible(viewer, &fleet.rules, items);
        if list.is_empty() {
            return Err(TetherError::NotFound(diagnostics.message("endpoints", viewer)));
        }
        if limit > 0 {
            list.truncate(limit);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(horde: &str, service: &str, port: u16) -> EpInfo {
        EpInfo {
            nodeid: format!("/Fleet/{}/node/{}/{}API", horde, service, service),
            netid: format!("/{}1/P/net/127.0.0.1:{}", service, port),
        }
    }

    fn viewer() -> NodeId {
        "/Fleet/sharks/node/Viewer/ViewerAPI".parse().unwrap()
    }

    fn rules() -> Vec<RuleInfo> {
        vec![RuleInfo {
            rule: "1".into(),
            horde: "sharks".into(),
            from: "Viewer".into(),
            to: "Pastiche".into(),
            owner: "admin".into(),
        }]
    }

    #[tokio::test]
    async fn test_delta_adds_and_removes() {
        let fleet = FleetCache::new();
        let a = info("sharks", "Pastiche", 7000);
        let b = info("sharks", "Pastiche", 7001);
        let added = fleet
            .apply_ep_delta(&EpDelta { state: 2, add: vec![a.clone(), b.clone()], del: vec![] })
            .await;
        assert_eq!(added, (2, 0));
        let removed = fleet
            .apply_ep_delta(&EpDelta { state: 3, add: vec![], del: vec![a] })
            .await;
        assert_eq!(removed, (0, 1));
        assert_eq!(fleet.last_state().await, 3);
    }

    #[tokio::test]
    async fn test_endpoints_up_follows_rules() {
        let fleet = FleetCache::new();
        fleet
            .apply_ep_delta(&EpDelta {
                state: 2,
                add: vec![info("sharks", "Pastiche", 7000), info("sharks", "Other", 7001)],
                del: vec![],
            })
            .await;
        fleet.replace_catalog(vec![], rules()).await;

        let up = fleet.endpoints_up(&viewer(), 0).await.unwrap();
        assert_eq!(up.len(), 1);
        assert!(up[0].nodeid.contains("Pastiche"));
        assert_eq!(up[0].stateadded, 2);

        fleet.replace_catalog(vec![], vec![]).await;
        let err = fleet.endpoints_up(&viewer(), 0).await.unwrap_err();
        assert!(err.to_string().contains("endpoints empty"));
    }

    #[tokio::test]
    async fn test_catalog_diagnostic_names_the_miss() {
        let fleet = FleetCache::new();
        let entry = CatalogInfo {
            nodeid: "/Fleet/sharks/node/Other/OtherAPI".into(),
            netid: "/Other1/P/net/127.0.0.1:7001".into(),
            filename: "n/a".into(),
        };
        fleet.replace_catalog(vec![entry], rules()).await;
        let err = fleet.catalog_for(&viewer()).await.unwrap_err();
        assert!(err.to_string().contains("not target"));
    }

    #[tokio::test]
    async fn test_limit_truncates() {
        let fleet = FleetCache::new();
        let add = (7000..7005).map(|p| info("sharks", "Pastiche", p)).collect();
        fleet.apply_ep_delta(&EpDelta { state: 1, add, del: vec![] }).await;
        fleet.replace_catalog(vec![], rules()).await;
        assert_eq!(fleet.endpoints_up(&viewer(), 2).await.unwrap().len(), 2);
    }
}
