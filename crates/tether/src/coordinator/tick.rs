//! Per-tick rule queries.
//!
//! For every visibility rule (`from` clients may call `to` endpoints inside
//! a horde) and a StateClock `t`, six cases decide which Reeves learn what:
//!
//! | case            | Reeves of                  | learn                         |
//! |-----------------|----------------------------|-------------------------------|
//! | old endpoints   | `to` endpoints added < t   | `from` keys added at t        |
//! | old clients     | `from` clients added < t   | `to` endpoints added at t     |
//! | new endpoints   | `to` endpoints added at t  | `from` keys added <= t        |
//! | new clients     | `from` clients added at t  | `to` endpoints added <= t     |
//! | del endpoints   | `to` endpoints live at t   | `from` keys removed at t      |
//! | del clients     | `from` clients live at t   | `to` endpoints removed at t   |
//!
//! Only live rows (`delstate = 0`) count except in the removal windows.

use anyhow::Result;
use rusqlite::{Connection, params};
use std::collections::BTreeSet;

use tether_common::constants::services;
use tether_common::{EpInfo, NetId};

/// What one set of Reeves should learn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReeveActions {
    pub reeves: Vec<NetId>,
    pub epinfo: Vec<EpInfo>,
    /// PubKey JSON strings
    pub keys: Vec<String>,
}

impl ReeveActions {
    pub fn is_empty(&self) -> bool {
        self.epinfo.is_empty() && self.keys.is_empty()
    }

    fn targets(&self, principal: &str) -> bool {
        self.reeves.iter().any(|r| r.principal == principal)
    }
}

/// The six cases for one rule row
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub rule: String,
    pub horde: String,
    pub old_endpoints: Option<ReeveActions>,
    pub old_clients: Option<ReeveActions>,
    pub new_endpoints: Option<ReeveActions>,
    pub new_clients: Option<ReeveActions>,
    pub del_endpoints: Option<ReeveActions>,
    pub del_clients: Option<ReeveActions>,
}

impl RuleUpdate {
    fn additions(&self) -> impl Iterator<Item = &ReeveActions> {
        [&self.old_endpoints, &self.old_clients, &self.new_endpoints, &self.new_clients]
            .into_iter()
            .flatten()
    }

    fn removals(&self) -> impl Iterator<Item = &ReeveActions> {
        [&self.del_endpoints, &self.del_clients].into_iter().flatten()
    }
}

/// Everything that changed visibility in one tick
#[derive(Debug, Clone, Default)]
pub struct TickUpdates {
    pub tick: i64,
    pub updates: Vec<RuleUpdate>,
}

/// Deduplicated add and delete payloads for one Reeve
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReeveBundle {
    pub add_epinfo: Vec<EpInfo>,
    pub del_epinfo: Vec<EpInfo>,
    pub add_keys: Vec<String>,
    pub del_keys: Vec<String>,
}

impl TickUpdates {
    /// Collect the payloads addressed to the Reeve run by `principal`.
    ///
    /// An item present on both sides was removed and re-added within the
    /// tick; it stays in the add list only.
    pub fn bundle_for(&self, principal: &str) -> ReeveBundle {
        let mut add_ep = BTreeSet::new();
        let mut del_ep = BTreeSet::new();
        let mut add_keys = BTreeSet::new();
        let mut del_keys = BTreeSet::new();

        for update in &self.updates {
            for actions in update.additions().filter(|a| a.targets(principal)) {
                add_ep.extend(actions.epinfo.iter().cloned());
                add_keys.extend(actions.keys.iter().cloned());
            }
            for actions in update.removals().filter(|a| a.targets(principal)) {
                del_ep.extend(actions.epinfo.iter().cloned());
                del_keys.extend(actions.keys.iter().cloned());
            }
        }

        ReeveBundle {
            del_epinfo: del_ep.difference(&add_ep).cloned().collect(),
            del_keys: del_keys.difference(&add_keys).cloned().collect(),
            add_epinfo: add_ep.into_iter().collect(),
            add_keys: add_keys.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Window {
    Before,
    At,
    UpTo,
    RemovedAt,
}

impl Window {
    fn predicate(self) -> &'static str {
        match self {
            Window::Before => "s.addstate < ?3 AND s.delstate = 0",
            Window::At => "s.addstate = ?3 AND s.delstate = 0",
            Window::UpTo => "s.addstate <= ?3 AND s.delstate = 0",
            Window::RemovedAt => "s.delstate = ?3 AND s.delstate > 0",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Endpoints,
    Clients,
}

impl Side {
    /// Rows of `service` in `horde` (params ?1, ?2) within the window on ?3
    fn members(self, window: Window) -> String {
        let (table, state, key) = match self {
            Side::Endpoints => ("endpoint", "epstate", "endpointuuid"),
            Side::Clients => ("client", "clstate", "clientuuid"),
        };
        format!(
            "{table} x JOIN {state} s ON x.{key} = s.{key}
             WHERE x.servicename = ?1 AND x.hordename = ?2 AND {}",
            window.predicate()
        )
    }
}

struct Triple<'a> {
    from: &'a str,
    to: &'a str,
    horde: &'a str,
    tick: i64,
}

fn reeves(conn: &Connection, side: Side, window: Window, service: &str, t: &Triple<'_>) -> Result<Vec<NetId>> {
    let sql = format!(
        "SELECT DISTINCT r.netid FROM endpoint r JOIN epstate rs ON r.endpointuuid = rs.endpointuuid
         WHERE r.servicename = ?4 AND rs.delstate = 0
           AND r.principal IN (SELECT x.principal FROM {})
         ORDER BY r.netid",
        side.members(window)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![service, t.horde, t.tick, services::REEVE], |r| {
        r.get::<_, String>(0)
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.parse()?);
    }
    Ok(out)
}

fn keys(conn: &Connection, window: Window, t: &Triple<'_>) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT DISTINCT x.pubkey FROM {} ORDER BY x.pubkey",
        Side::Clients.members(window)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![t.from, t.horde, t.tick], |r| r.get::<_, String>(0))?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn epinfo(conn: &Connection, window: Window, t: &Triple<'_>) -> Result<Vec<EpInfo>> {
    let sql = format!(
        "SELECT DISTINCT x.nodeid, x.netid FROM {} ORDER BY x.nodeid, x.netid",
        Side::Endpoints.members(window)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![t.to, t.horde, t.tick], |r| {
        Ok(EpInfo {
            nodeid: r.get(0)?,
            netid: r.get(1)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn case(reeves: Vec<NetId>, epinfo: Vec<EpInfo>, keys: Vec<String>) -> Option<ReeveActions> {
    let actions = ReeveActions { reeves, epinfo, keys };
    if actions.reeves.is_empty() || actions.is_empty() {
        None
    } else {
        Some(actions)
    }
}

/// Endpoint Reeves learn client keys
fn endpoint_case(conn: &Connection, t: &Triple<'_>, reeve_window: Window, key_window: Window) -> Result<Option<ReeveActions>> {
    Ok(case(
        reeves(conn, Side::Endpoints, reeve_window, t.to, t)?,
        Vec::new(),
        keys(conn, key_window, t)?,
    ))
}

/// Client Reeves learn endpoints
fn client_case(conn: &Connection, t: &Triple<'_>, reeve_window: Window, ep_window: Window) -> Result<Option<ReeveActions>> {
    Ok(case(
        reeves(conn, Side::Clients, reeve_window, t.from, t)?,
        epinfo(conn, ep_window, t)?,
        Vec::new(),
    ))
}

/// Evaluate every rule row for StateClock `tick`
pub fn update_on_tick(conn: &Connection, tick: i64) -> Result<TickUpdates> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT a.ruleid, c.servicename, e.servicename, e.hordename
         FROM allowed a
         JOIN clgroup c ON a.clgroupid = c.clgroupid
         JOIN epgroup e ON a.epgroupid = e.epgroupid
         ORDER BY a.ruleid, e.hordename",
    )?;
    let rules = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut updates = Vec::new();
    for (rule, from, to, horde) in &rules {
        let t = Triple {
            from,
            to,
            horde,
            tick,
        };
        let update = RuleUpdate {
            rule: rule.clone(),
            horde: horde.clone(),
            old_endpoints: endpoint_case(conn, &t, Window::Before, Window::At)?,
            old_clients: client_case(conn, &t, Window::Before, Window::At)?,
            new_endpoints: endpoint_case(conn, &t, Window::At, Window::UpTo)?,
            new_clients: client_case(conn, &t, Window::At, Window::UpTo)?,
            del_endpoints: endpoint_case(conn, &t, Window::UpTo, Window::RemovedAt)?,
            del_clients: client_case(conn, &t, Window::UpTo, Window::RemovedAt)?,
        };
        let any = update.additions().next().is_some() || update.removals().next().is_some();
        if any {
            updates.push(update);
        }
    }
    Ok(TickUpdates { tick, updates })
}
