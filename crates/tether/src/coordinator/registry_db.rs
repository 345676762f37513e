//! SQLite registry of endpoints, clients, visibility rules and state history.
//!
//! Every endpoint and client row is paired with a state row recording the
//! StateClock it was added in (`addstate`) and, once removed, the clock it
//! was removed in (`delstate`, zero while live).

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use tether_common::constants::services;
use tether_common::{
    CatalogInfo, ClientData, EndpointData, KeyId, NetId, NodeId, PubKey, RuleInfo, TetherError,
};

use super::ingest::StateClock;
use super::tick::{self, TickUpdates};
use crate::signing::verifying_key;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS endpoint (
    endpointuuid TEXT NOT NULL PRIMARY KEY,
    nodeid TEXT NOT NULL, netid TEXT NOT NULL,
    blocname TEXT, hordename TEXT, nodename TEXT,
    servicename TEXT, serviceapi TEXT, servicerev TEXT, principal TEXT,
    address TEXT, hash TEXT, startedts TEXT, lastts TEXT, status TEXT);
CREATE TABLE IF NOT EXISTS client (
    clientuuid TEXT NOT NULL PRIMARY KEY,
    nodeid TEXT NOT NULL,
    blocname TEXT, hordename TEXT,
    servicename TEXT, serviceapi TEXT, servicerev TEXT, principal TEXT,
    keyid TEXT, pubkey TEXT, startedts TEXT, lastts TEXT, status TEXT);
CREATE TABLE IF NOT EXISTS allowed (
    ruleuuid TEXT NOT NULL PRIMARY KEY, ruleid TEXT, epgroupid TEXT, clgroupid TEXT, ownerid TEXT);
CREATE TABLE IF NOT EXISTS clgroup (
    clgroupid TEXT NOT NULL PRIMARY KEY, servicename TEXT, hordename TEXT);
CREATE TABLE IF NOT EXISTS epgroup (
    epgroupid TEXT NOT NULL PRIMARY KEY, servicename TEXT, hordename TEXT);
CREATE TABLE IF NOT EXISTS statetime (
    stateno INTEGER NOT NULL PRIMARY KEY, starts TEXT, endts TEXT);
CREATE TABLE IF NOT EXISTS epstate (
    entryno INTEGER PRIMARY KEY, endpointuuid TEXT, addstate INTEGER, delstate INTEGER, curstate INTEGER);
CREATE TABLE IF NOT EXISTS clstate (
    entryno INTEGER PRIMARY KEY, clientuuid TEXT, addstate INTEGER, delstate INTEGER, curstate INTEGER);
CREATE TABLE IF NOT EXISTS badrequest (
    requestuuid TEXT NOT NULL PRIMARY KEY, keyid TEXT, stateno INTEGER, requestts TEXT, error TEXT);
CREATE TABLE IF NOT EXISTS admitted (
    keyid TEXT NOT NULL PRIMARY KEY, nodeid TEXT, netid TEXT, pubkey TEXT, admittedts TEXT);
CREATE INDEX IF NOT EXISTS epstate_uuid ON epstate(endpointuuid);
CREATE INDEX IF NOT EXISTS clstate_uuid ON clstate(clientuuid);
";

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

/// An endpoint row ready for insertion
#[derive(Debug, Clone)]
pub struct EndpointRow {
    pub endpoint_uuid: String,
    pub nodeid: NodeId,
    pub netid: NetId,
    pub hash: String,
    pub started_ts: String,
    pub status: String,
}

/// A client (public key) row ready for insertion
#[derive(Debug, Clone)]
pub struct ClientRow {
    pub client_uuid: String,
    pub nodeid: NodeId,
    pub keyid: KeyId,
    pub pubkey: String,
    pub started_ts: String,
    pub status: String,
}

/// Validate an endpoint record and build its row
pub fn make_endpoint_row(data: &EndpointData) -> Result<EndpointRow, TetherError> {
    let netid: NetId = data.netid.parse()?;
    if netid.query {
        return Err(TetherError::InvalidArgument(format!(
            "query netid {} cannot be registered",
            data.netid
        )));
    }
    let nodeid: NodeId = data.nodeid.parse()?;
    let started_ts = if data.created_at.is_empty() {
        now_ts()
    } else {
        data.created_at.clone()
    };
    Ok(EndpointRow {
        endpoint_uuid: Uuid::new_v4().to_string(),
        nodeid,
        netid,
        hash: data.hash.clone(),
        started_ts,
        status: data.status.as_str().to_string(),
    })
}

/// Validate a client record and build its row.
///
/// The embedded key JSON must parse, carry the same KeyID as the record, and
/// hold key material matching that KeyID.
pub fn make_client_row(data: &ClientData) -> Result<ClientRow, TetherError> {
    let nodeid: NodeId = data.nodeid.parse()?;
    let keyid: KeyId = data.keyid.parse()?;
    if keyid.is_query() {
        return Err(TetherError::InvalidArgument(format!(
            "query keyid {} cannot be registered",
            data.keyid
        )));
    }
    let pk = PubKey::from_json(&data.keyjson)?;
    if pk.keyid != data.keyid {
        return Err(TetherError::InvalidArgument(
            "keyid string mismatch with json pubkey".into(),
        ));
    }
    verifying_key(&pk)?;
    Ok(ClientRow {
        client_uuid: Uuid::new_v4().to_string(),
        nodeid,
        keyid,
        pubkey: data.keyjson.clone(),
        started_ts: now_ts(),
        status: data.status.as_str().to_string(),
    })
}

/// One catalog example, tagged with the horde it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub horde: String,
    pub info: CatalogInfo,
}

/// A live Reeve endpoint the coordinator pushes deltas to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReeveTarget {
    pub nodeid: NodeId,
    pub netid: NetId,
}

/// Rows written by one `insert_*` call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InsertSummary {
    pub inserted: usize,
    /// Already live under the same identity; skipped
    pub duplicates: usize,
}

pub struct RegistryDb {
    conn: Mutex<Connection>,
}

impl RegistryDb {
    /// Open (or create) the registry database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating registry directory")?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening registry database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self::with_connection(conn)?;
        info!(path = %path.display(), "Registry database initialized");
        Ok(db)
    }

    /// In-memory registry, used by tests and throwaway coordinators
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("creating registry schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("registry connection lock poisoned"))
    }

    /// Insert endpoint rows and their state rows in one transaction
    pub fn insert_endpoints(&self, rows: &[EndpointRow], state: i64) -> Result<InsertSummary> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut summary = InsertSummary::default();
        {
            let mut live = tx.prepare_cached(
                "SELECT 1 FROM endpoint e JOIN epstate s ON e.endpointuuid = s.endpointuuid
                 WHERE e.nodeid = ?1 AND e.netid = ?2 AND s.delstate = 0 LIMIT 1",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO endpoint (endpointuuid, nodeid, netid, blocname, hordename, nodename,
                    servicename, serviceapi, servicerev, principal, address, hash, startedts, lastts, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            let mut insert_state = tx.prepare_cached(
                "INSERT INTO epstate (endpointuuid, addstate, delstate, curstate) VALUES (?1, ?2, 0, ?2)",
            )?;

            for row in rows {
                let nodeid = row.nodeid.to_string();
                let netid = row.netid.to_string();
                let exists = live
                    .query_row(params![nodeid, netid], |_| Ok(()))
                    .optional()?
                    .is_some();
                if exists {
                    summary.duplicates += 1;
                    continue;
                }
                insert.execute(params![
                    row.endpoint_uuid,
                    nodeid,
                    netid,
                    row.nodeid.bloc,
                    row.nodeid.horde,
                    row.nodeid.node,
                    row.nodeid.service_name,
                    row.nodeid.service_api,
                    row.netid.service_rev,
                    row.netid.principal,
                    row.netid.address(),
                    row.hash,
                    row.started_ts,
                    now_ts(),
                    row.status,
                ])?;
                insert_state.execute(params![row.endpoint_uuid, state])?;
                summary.inserted += 1;
            }
        }
        tx.commit()?;
        debug!(?summary, state, "Inserted endpoints");
        Ok(summary)
    }

    /// Insert client rows and their state rows in one transaction
    pub fn insert_clients(&self, rows: &[ClientRow], state: i64) -> Result<InsertSummary> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut summary = InsertSummary::default();
        {
            let mut live = tx.prepare_cached(
                "SELECT 1 FROM client c JOIN clstate s ON c.clientuuid = s.clientuuid
                 WHERE c.nodeid = ?1 AND c.keyid = ?2 AND s.delstate = 0 LIMIT 1",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO client (clientuuid, nodeid, blocname, hordename, servicename, serviceapi,
                    servicerev, principal, keyid, pubkey, startedts, lastts, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            let mut insert_state = tx.prepare_cached(
                "INSERT INTO clstate (clientuuid, addstate, delstate, curstate) VALUES (?1, ?2, 0, ?2)",
            )?;

            for row in rows {
                let nodeid = row.nodeid.to_string();
                let keyid = row.keyid.to_string();
                let exists = live
                    .query_row(params![nodeid, keyid], |_| Ok(()))
                    .optional()?
                    .is_some();
                if exists {
                    summary.duplicates += 1;
                    continue;
                }
                insert.execute(params![
                    row.client_uuid,
                    nodeid,
                    row.nodeid.bloc,
                    row.nodeid.horde,
                    row.nodeid.service_name,
                    row.nodeid.service_api,
                    row.keyid.service_rev,
                    row.keyid.principal,
                    keyid,
                    row.pubkey,
                    row.started_ts,
                    now_ts(),
                    row.status,
                ])?;
                insert_state.execute(params![row.client_uuid, state])?;
                summary.inserted += 1;
            }
        }
        tx.commit()?;
        debug!(?summary, state, "Inserted clients");
        Ok(summary)
    }

    /// Mark the live endpoint `nodeid`/`netid` removed in `state`
    pub fn remove_endpoint(&self, nodeid: &str, netid: &str, state: i64) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE epstate SET delstate = ?3, curstate = ?3
             WHERE delstate = 0 AND endpointuuid IN
                (SELECT endpointuuid FROM endpoint WHERE nodeid = ?1 AND netid = ?2)",
            params![nodeid, netid, state],
        )?;
        conn.execute(
            "UPDATE endpoint SET status = ?3, lastts = ?4 WHERE nodeid = ?1 AND netid = ?2",
            params![nodeid, netid, "DOWN", now_ts()],
        )?;
        Ok(n)
    }

    /// Mark the live client key `keyid` removed in `state`
    pub fn remove_client(&self, keyid: &str, state: i64) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE clstate SET delstate = ?2, curstate = ?2
             WHERE delstate = 0 AND clientuuid IN (SELECT clientuuid FROM client WHERE keyid = ?1)",
            params![keyid, state],
        )?;
        conn.execute(
            "UPDATE client SET status = ?2, lastts = ?3 WHERE keyid = ?1",
            params![keyid, "REVOKED", now_ts()],
        )?;
        Ok(n)
    }

    /// Record a request that failed validation
    pub fn mark_bad_request(&self, request_uuid: &str, keyid: &str, state: i64, error: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO badrequest (requestuuid, keyid, stateno, requestts, error)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![request_uuid, keyid, state, now_ts(), error],
        )?;
        Ok(())
    }

    /// Record the wall-clock bounds of a StateClock interval
    pub fn mark_state_time(&self, clock: &StateClock) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO statetime (stateno, starts, endts) VALUES (?1, ?2, ?3)",
            params![
                clock.state,
                clock.begin.map(|t| t.to_rfc3339()),
                clock.end.map(|t| t.to_rfc3339())
            ],
        )?;
        Ok(())
    }

    /// Highest StateClock recorded so far
    pub fn last_state(&self) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let state: Option<i64> = conn.query_row("SELECT MAX(stateno) FROM statetime", [], |r| r.get(0))?;
        Ok(state)
    }

    /// Add a rule for `from` to see `to` inside `horde`
    pub fn add_rule(&self, rule: &RuleInfo) -> Result<String> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let clgroup = group_id(&tx, "clgroup", "clgroupid", &rule.from, &rule.horde)?;
        let epgroup = group_id(&tx, "epgroup", "epgroupid", &rule.to, &rule.horde)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT ruleuuid FROM allowed WHERE ruleid = ?1 AND clgroupid = ?2 AND epgroupid = ?3",
                params![rule.rule, clgroup, epgroup],
                |r| r.get(0),
            )
            .optional()?;
        let rule_uuid = match existing {
            Some(uuid) => uuid,
            None => {
                let uuid = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO allowed (ruleuuid, ruleid, epgroupid, clgroupid, ownerid)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![uuid, rule.rule, epgroup, clgroup, rule.owner],
                )?;
                uuid
            }
        };
        tx.commit()?;
        Ok(rule_uuid)
    }

    /// Remove rule `rule` within `horde`; returns the number of rows dropped
    pub fn remove_rule(&self, rule: &str, horde: &str) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM allowed WHERE ruleid = ?1 AND epgroupid IN
                (SELECT epgroupid FROM epgroup WHERE hordename = ?2)",
            params![rule, horde],
        )?;
        Ok(n)
    }

    /// Insert `rules` only when no rule exists yet
    pub fn seed_rules(&self, rules: &[RuleInfo]) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM allowed", [], |r| r.get(0))?;
        if count > 0 {
            return Ok(0);
        }
        for rule in rules {
            self.add_rule(rule)?;
        }
        info!(rules = rules.len(), "Seeded visibility rules");
        Ok(rules.len())
    }

    /// All visibility rules
    pub fn rules(&self) -> Result<Vec<RuleInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT a.ruleid, e.hordename, c.servicename, e.servicename, a.ownerid
             FROM allowed a
             JOIN clgroup c ON a.clgroupid = c.clgroupid
             JOIN epgroup e ON a.epgroupid = e.epgroupid
             ORDER BY e.hordename, a.ruleid, c.servicename, e.servicename",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(RuleInfo {
                rule: r.get(0)?,
                horde: r.get(1)?,
                from: r.get(2)?,
                to: r.get(3)?,
                owner: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// One live example endpoint per (bloc, horde, service, api, rev)
    pub fn gather_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT e.hordename, e.nodeid, e.netid, e.hash FROM endpoint e
             WHERE e.endpointuuid IN (
                SELECT MAX(x.endpointuuid) FROM endpoint x
                JOIN epstate s ON x.endpointuuid = s.endpointuuid
                WHERE s.delstate = 0
                GROUP BY x.blocname, x.hordename, x.servicename, x.serviceapi, x.servicerev)
             ORDER BY e.hordename, e.servicename",
        )?;
        let rows = stmt.query_map([], |r| {
            let hash: Option<String> = r.get(3)?;
            Ok(CatalogEntry {
                horde: r.get(0)?,
                info: CatalogInfo {
                    nodeid: r.get(1)?,
                    netid: r.get(2)?,
                    filename: hash.filter(|h| !h.is_empty()).unwrap_or_else(|| "n/a".to_string()),
                },
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Every live Reeve endpoint
    pub fn gather_reeves(&self) -> Result<Vec<ReeveTarget>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT e.nodeid, e.netid FROM endpoint e
             JOIN epstate s ON e.endpointuuid = s.endpointuuid
             WHERE e.servicename = ?1 AND s.delstate = 0
             ORDER BY e.hordename, e.principal",
        )?;
        let rows = stmt.query_map([services::REEVE], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;

        let mut reeves = Vec::new();
        for row in rows {
            let (nodeid, netid) = row?;
            reeves.push(ReeveTarget {
                nodeid: nodeid.parse()?,
                netid: netid.parse()?,
            });
        }
        Ok(reeves)
    }

    /// Remember an agent key admitted by the join handshake
    pub fn admit_agent(&self, nodeid: &NodeId, netid: &NetId, pubkey: &PubKey) -> Result<()> {
        let keyjson = pubkey.to_json()?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO admitted (keyid, nodeid, netid, pubkey, admittedts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![pubkey.keyid, nodeid.to_string(), netid.to_string(), keyjson, now_ts()],
        )?;
        Ok(())
    }

    /// Key JSON of every admitted agent and of every live Reeve client key
    pub fn trusted_agent_keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT pubkey FROM admitted
             UNION
             SELECT c.pubkey FROM client c JOIN clstate s ON c.clientuuid = s.clientuuid
             WHERE c.servicename = ?1 AND s.delstate = 0",
        )?;
        let rows = stmt.query_map([services::REEVE], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Run the six rule cases for StateClock `state`
    pub fn update_on_tick(&self, state: i64) -> Result<TickUpdates> {
        let conn = self.conn()?;
        tick::update_on_tick(&conn, state)
    }

    pub fn count_live_endpoints(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM epstate WHERE delstate = 0", [], |r| r.get(0))?)
    }

    pub fn count_live_clients(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM clstate WHERE delstate = 0", [], |r| r.get(0))?)
    }

    /// Request ids recorded as bad, oldest first
    pub fn bad_requests(&self) -> Result<Vec<(String, i64, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT requestuuid, stateno, error FROM badrequest ORDER BY stateno, requestts",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

/// Find or create the service group for `service` in `horde`
fn group_id(conn: &Connection, table: &str, column: &str, service: &str, horde: &str) -> Result<String> {
    let select = format!(
        "SELECT {column} FROM {table} WHERE servicename = ?1 AND hordename = ?2"
    );
    if let Some(id) = conn
        .query_row(&select, params![service, horde], |r| r.get::<_, String>(0))
        .optional()?
    {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    let insert = format!("INSERT INTO {table} ({column}, servicename, hordename) VALUES (?1, ?2, ?3)");
    conn.execute(&insert, params![id, service, horde])?;
    Ok(id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signing::KeyPair;
    use tether_common::{KeyStatus, ServiceState};

    pub(crate) fn endpoint(horde: &str, service: &str, principal: &str, port: u16) -> EndpointData {
        EndpointData {
            nodeid: format!("/Fleet/{}/node{}/{}/{}API", horde, port, service, service),
            netid: format!("/{}1/{}/net/127.0.0.1:{}", service, principal, port),
            status: ServiceState::Up,
            ..Default::default()
        }
    }

    pub(crate) fn client(horde: &str, service: &str, principal: &str) -> (ClientData, KeyPair) {
        let pair = KeyPair::generate(&format!("{}1", service), principal).unwrap();
        let data = ClientData {
            nodeid: format!("/Fleet/{}/node/{}/{}API", horde, service, service),
            keyid: pair.key_id().to_string(),
            keyjson: pair.pubkey_json().unwrap(),
            status: KeyStatus::Current,
        };
        (data, pair)
    }

    #[test]
    fn test_endpoint_row_rejects_query_netid() {
        let mut data = endpoint("sharks", "Pastiche", "P", 7000);
        data.netid = "/Pastiche1/P/net/*".into();
        assert!(make_endpoint_row(&data).is_err());
    }

    #[test]
    fn test_client_row_rejects_keyid_mismatch() {
        let (mut data, _) = client("sharks", "Viewer", "P");
        let (other, _) = client("sharks", "Viewer", "P");
        data.keyid = other.keyid;
        let err = make_client_row(&data).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn test_insert_is_idempotent_per_identity() {
        let db = RegistryDb::open_in_memory().unwrap();
        let row = make_endpoint_row(&endpoint("sharks", "Pastiche", "P", 7000)).unwrap();
        let again = make_endpoint_row(&endpoint("sharks", "Pastiche", "P", 7000)).unwrap();

        let first = db.insert_endpoints(&[row], 1).unwrap();
        let second = db.insert_endpoints(&[again], 2).unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(second.duplicates, 1);
        assert_eq!(db.count_live_endpoints().unwrap(), 1);
    }

    #[test]
    fn test_remove_marks_delstate() {
        let db = RegistryDb::open_in_memory().unwrap();
        let data = endpoint("sharks", "Pastiche", "P", 7000);
        db.insert_endpoints(&[make_endpoint_row(&data).unwrap()], 1).unwrap();
        assert_eq!(db.remove_endpoint(&data.nodeid, &data.netid, 2).unwrap(), 1);
        assert_eq!(db.count_live_endpoints().unwrap(), 0);

        let (cl, _) = client("sharks", "Viewer", "P");
        db.insert_clients(&[make_client_row(&cl).unwrap()], 1).unwrap();
        assert_eq!(db.remove_client(&cl.keyid, 3).unwrap(), 1);
        assert_eq!(db.count_live_clients().unwrap(), 0);
    }

    #[test]
    fn test_rules_seed_once_and_remove() {
        let db = RegistryDb::open_in_memory().unwrap();
        let rules = vec![
            RuleInfo {
                rule: "1".into(),
                horde: "sharks".into(),
                from: "Viewer".into(),
                to: "Pastiche".into(),
                owner: "admin".into(),
            },
            RuleInfo {
                rule: "1".into(),
                horde: "jets".into(),
                from: "Viewer".into(),
                to: "Pastiche".into(),
                owner: "admin".into(),
            },
        ];
        assert_eq!(db.seed_rules(&rules).unwrap(), 2);
        assert_eq!(db.seed_rules(&rules).unwrap(), 0);
        assert_eq!(db.rules().unwrap().len(), 2);

        assert_eq!(db.remove_rule("1", "sharks").unwrap(), 1);
        let left = db.rules().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].horde, "jets");
    }

    #[test]
    fn test_catalog_one_example_per_service() {
        let db = RegistryDb::open_in_memory().unwrap();
        let rows: Vec<_> = [7000, 7001]
            .iter()
            .map(|p| make_endpoint_row(&endpoint("sharks", "Pastiche", "P", *p)).unwrap())
            .collect();
        db.insert_endpoints(&rows, 1).unwrap();
        db.insert_endpoints(&[make_endpoint_row(&endpoint("sharks", "Reeve", "P", 50059)).unwrap()], 1)
            .unwrap();

        let catalog = db.gather_catalog().unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.iter().all(|c| c.horde == "sharks"));
        assert_eq!(db.gather_reeves().unwrap().len(), 1);
    }

    #[test]
    fn test_admitted_and_reeve_keys_are_trusted() {
        let db = RegistryDb::open_in_memory().unwrap();
        let joiner = KeyPair::generate("Reeve1", "PJ").unwrap();
        let nodeid: NodeId = "/Fleet/sharks/nodeJ/Reeve/ReeveAPI".parse().unwrap();
        let netid: NetId = "/Reeve1/PJ/net/127.0.0.1:50059".parse().unwrap();
        db.admit_agent(&nodeid, &netid, joiner.pubkey()).unwrap();
        db.admit_agent(&nodeid, &netid, joiner.pubkey()).unwrap();

        let (reeve, reeve_keys) = client("sharks", "Reeve", "PR");
        let (viewer, _) = client("sharks", "Viewer", "PR");
        db.insert_clients(&[make_client_row(&reeve).unwrap(), make_client_row(&viewer).unwrap()], 1)
            .unwrap();

        let trusted = db.trusted_agent_keys().unwrap();
        assert_eq!(trusted.len(), 2);
        let ids: Vec<String> = trusted
            .iter()
            .map(|raw| PubKey::from_json(raw).unwrap().keyid)
            .collect();
        assert!(ids.contains(&joiner.key_id().to_string()));
        assert!(ids.contains(&reeve_keys.key_id().to_string()));

        db.remove_client(&reeve.keyid, 2).unwrap();
        assert_eq!(db.trusted_agent_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_state_time_recorded() {
        let db = RegistryDb::open_in_memory().unwrap();
        let clock = StateClock {
            state: 4,
            begin: Some(Utc::now()),
            end: Some(Utc::now()),
        };
        db.mark_state_time(&clock).unwrap();
        assert_eq!(db.last_state().unwrap(), Some(4));
    }
}
