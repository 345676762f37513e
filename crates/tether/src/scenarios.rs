//! End-to-end runs of a coordinator and agents on loopback listeners.

use axum::{Router, middleware, routing::post};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;

use tether_common::constants::{ED25519_ALGORITHM, services};
use tether_common::ids::local_uuid;
use tether_common::{
    Ack, ClientData, EndpointEntry, EndpointsUpRequest, NetId, NodeId, RuleInfo, TetherError,
};

use crate::agent::store::RecordState;
use crate::agent::{Agent, AgentSettings};
use crate::config::Placement;
use crate::coordinator::registry_db::tests::{client, endpoint};
use crate::coordinator::{Coordinator, CoordinatorSettings};
use crate::flock::FlockKey;
use crate::handshake::{CoordinatorSlot, JoinIdentity, JoinSettings, join_fleet};
use crate::rpc::{self, SignedClient, paths};
use crate::signing::{KeyPair, SignatureAuthority, Whitelist, require_signature};

fn placement(horde: &str, node: &str, principal: &str) -> Placement {
    Placement {
        bloc: "Fleet".into(),
        horde: horde.into(),
        node: node.into(),
        principal: principal.into(),
    }
}

fn coordinator_settings(tick: Duration, rules: Vec<RuleInfo>) -> CoordinatorSettings {
    CoordinatorSettings {
        placement: placement("sharks", "hub", "fleetadmin"),
        steward_addr: "127.0.0.1:0".into(),
        registry_addr: "127.0.0.1:0".into(),
        db_path: None,
        tick,
        reeve_timeout: Duration::from_secs(2),
        callback_retry: Duration::from_millis(200),
        allowed_algorithms: vec![ED25519_ALGORITHM.to_string()],
        rules,
    }
}

fn agent_settings(coordinator: &Coordinator, dir: &Path, node: &str, principal: &str) -> AgentSettings {
    AgentSettings {
        placement: placement("sharks", node, principal),
        listen_addr: "127.0.0.1:0".into(),
        registry_url: format!("http://{}", coordinator.registry_addr()),
        data_dir: dir.to_path_buf(),
        ping_delay: Duration::from_millis(100),
        ping_timeout: Duration::from_secs(5),
        register_timeout: Duration::from_secs(5),
        forwarder_queue: 64,
        allowed_algorithms: vec![ED25519_ALGORITHM.to_string()],
    }
}

fn rule(id: &str, from: &str, to: &str) -> RuleInfo {
    RuleInfo {
        rule: id.into(),
        horde: "sharks".into(),
        from: from.into(),
        to: to.into(),
        owner: "fleetadmin".into(),
    }
}

async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn signed(keys: &Arc<KeyPair>) -> SignedClient {
    SignedClient::new(rpc::http_client(Duration::from_secs(5)).unwrap(), keys.clone())
}

/// 40 clients and 40 endpoints, every tenth malformed, land within 10s on a 3s tick
#[tokio::test]
async fn scenario_batch_ingest_with_bad_records() {
    let started = Instant::now();
    let keys = Arc::new(KeyPair::generate(services::STEWARD_REV, "fleetadmin").unwrap());
    let coordinator = Coordinator::start(
        coordinator_settings(Duration::from_secs(3), vec![]),
        keys.clone(),
        FlockKey::generate(),
    )
    .await
    .unwrap();
    let steward = format!("http://{}", coordinator.steward_addr());
    let http = signed(&keys);

    let (_, stranger) = client("sharks", "Viewer", "stranger");
    for i in 0..40u16 {
        let (mut data, _) = client("sharks", "Viewer", &format!("C{}", i));
        let mut ep = endpoint("sharks", "Pastiche", &format!("E{}", i), 7000 + i);
        if i % 10 == 9 {
            data.keyjson = stranger.pubkey_json().unwrap();
            ep.netid = format!("/Pastiche1/*/net/127.0.0.1:{}", 7000 + i);
        }
        let ack: Ack = http.post(&steward, paths::CLIENT_UPDATE, &data).await.unwrap();
        assert!(!ack.remoteuuid.is_empty());
        let ack: Ack = http.post(&steward, paths::ENDPOINT_UPDATE, &ep).await.unwrap();
        assert!(!ack.remoteuuid.is_empty());
    }

    let db = coordinator.state().db.clone();
    let landed = eventually(Duration::from_secs(10).saturating_sub(started.elapsed()), || {
        let db = db.clone();
        async move {
            db.count_live_clients().unwrap() == 36
                && db.count_live_endpoints().unwrap() == 36
                && db.bad_requests().unwrap().len() == 8
        }
    })
    .await;
    assert!(landed, "batch did not land within 10s");

    let bad = db.bad_requests().unwrap();
    assert!(bad.iter().all(|(_, state, _)| *state >= 1));
    coordinator.shutdown().await;
}

async fn serve_callback(authority: SignatureAuthority) -> (NetId, tokio::task::JoinHandle<()>) {
    let router = Router::new()
        .route(paths::COORDINATOR_PING, post(crate::routes::ping))
        .route_layer(middleware::from_fn_with_state(authority, require_signature));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    let netid = NetId::from_address(services::REEVE_REV, "joiner", &addr.to_string()).unwrap();
    (netid, task)
}

struct JoinAttempt {
    result: Result<(), TetherError>,
    whitelist: Whitelist,
    slot: CoordinatorSlot,
    keys: Arc<KeyPair>,
    elapsed: Duration,
}

async fn try_join(coordinator: &Coordinator, flock: &FlockKey, algorithms: Vec<String>) -> JoinAttempt {
    let keys = Arc::new(KeyPair::generate(services::REEVE_REV, "joiner").unwrap());
    let whitelist = Whitelist::new();
    whitelist.add(keys.pubkey()).await.unwrap();
    let (netid, task) = serve_callback(SignatureAuthority::new(whitelist.clone(), algorithms)).await;

    let slot = CoordinatorSlot::ephemeral();
    let me = JoinIdentity {
        nodeid: NodeId::new("Fleet", "sharks", "joiner", services::REEVE, services::REEVE_API).unwrap(),
        netid,
        pubkey: keys.pubkey().clone(),
    };
    let settings = JoinSettings {
        registry_url: format!("http://{}", coordinator.registry_addr()),
        ping_delay: Duration::from_millis(100),
        ping_timeout: Duration::from_secs(2),
        register_timeout: Duration::from_secs(3),
    };
    let http = rpc::http_client(Duration::from_secs(10)).unwrap();
    let started = Instant::now();
    let result = join_fleet(&http, flock, &settings, &me, &whitelist, &slot).await.map(|_| ());
    let elapsed = started.elapsed();
    task.abort();
    JoinAttempt {
        result,
        whitelist,
        slot,
        keys,
        elapsed,
    }
}

/// A callback the joiner cannot verify ends in an error and undoes the trust it installed
#[tokio::test]
async fn scenario_failed_callback_rolls_back() {
    let keys = Arc::new(KeyPair::generate(services::STEWARD_REV, "fleetadmin").unwrap());
    let mut settings = coordinator_settings(Duration::from_millis(500), vec![]);
    settings.reeve_timeout = Duration::from_millis(800);
    let flock = FlockKey::generate();
    let coordinator = Coordinator::start(settings, keys.clone(), flock.clone()).await.unwrap();

    let attempt = try_join(&coordinator, &flock, vec!["hmac-sha256".to_string()]).await;
    assert!(attempt.result.is_err());
    assert!(attempt.elapsed < Duration::from_secs(5), "took {:?}", attempt.elapsed);
    assert!(!attempt.whitelist.contains(&keys.key_id().to_string()).await);
    assert_eq!(attempt.whitelist.len().await, 1);
    assert!(!attempt.slot.is_recorded().await);
    assert!(
        !coordinator
            .state()
            .authority
            .whitelist()
            .contains(&attempt.keys.key_id().to_string())
            .await
    );
    coordinator.shutdown().await;
}

/// A verifiable callback leaves each side trusting the other
#[tokio::test]
async fn scenario_successful_join_trusts_both_ways() {
    let keys = Arc::new(KeyPair::generate(services::STEWARD_REV, "fleetadmin").unwrap());
    let flock = FlockKey::generate();
    let coordinator = Coordinator::start(
        coordinator_settings(Duration::from_millis(500), vec![]),
        keys.clone(),
        flock.clone(),
    )
    .await
    .unwrap();

    let attempt = try_join(&coordinator, &flock, vec![ED25519_ALGORITHM.to_string()]).await;
    attempt.result.unwrap();
    assert!(attempt.whitelist.contains(&keys.key_id().to_string()).await);
    assert_eq!(attempt.slot.get().await.unwrap().keyid, keys.key_id().to_string());
    assert!(
        coordinator
            .state()
            .authority
            .whitelist()
            .contains(&attempt.keys.key_id().to_string())
            .await
    );
    coordinator.shutdown().await;
}

async fn endpoints_up(agent: &Agent, viewer: &Arc<KeyPair>, nodeid: &str) -> Result<Vec<EndpointEntry>, TetherError> {
    let http = SignedClient::new(rpc::http_client(Duration::from_secs(5))?, viewer.clone());
    let req = EndpointsUpRequest {
        nodeid: nodeid.into(),
        keyid: viewer.key_id().to_string(),
        limit: 0,
    };
    http.post(&format!("http://{}", agent.addr()), paths::ENDPOINTS_UP, &req).await
}

/// An endpoint registered on one agent becomes visible on another through a
/// rule, and disappears again once the rule is removed
#[tokio::test]
async fn scenario_rule_controls_visibility_across_agents() {
    let tick = Duration::from_millis(300);
    let keys = Arc::new(KeyPair::generate(services::STEWARD_REV, "fleetadmin").unwrap());
    let flock = FlockKey::generate();
    let coordinator = Coordinator::start(
        coordinator_settings(tick, vec![rule("viewer-pastiche", "Viewer", "Pastiche")]),
        keys,
        flock.clone(),
    )
    .await
    .unwrap();

    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let keys_a = Arc::new(KeyPair::generate(services::REEVE_REV, "PA").unwrap());
    let keys_b = Arc::new(KeyPair::generate(services::REEVE_REV, "PB").unwrap());
    let agent_a = Agent::start(agent_settings(&coordinator, dir_a.path(), "nodeA", "PA"), keys_a.clone(), flock.clone())
        .await
        .unwrap();
    let agent_b = Agent::start(agent_settings(&coordinator, dir_b.path(), "nodeB", "PB"), keys_b.clone(), flock)
        .await
        .unwrap();

    // A runs a Pastiche endpoint
    let pastiche = endpoint("sharks", "Pastiche", "PA", 7101);
    let ack: Ack = signed(&keys_a)
        .post(&format!("http://{}", agent_a.addr()), paths::REGISTER_ENDPOINT, &pastiche)
        .await
        .unwrap();
    assert!(!ack.localuuid.is_empty());

    // B runs a Viewer client
    let viewer = Arc::new(KeyPair::generate("Viewer1", "PB").unwrap());
    let viewer_node = "/Fleet/sharks/nodeB/Viewer/ViewerAPI";
    let data = ClientData {
        nodeid: viewer_node.into(),
        keyid: viewer.key_id().to_string(),
        keyjson: viewer.pubkey_json().unwrap(),
        status: tether_common::KeyStatus::Current,
    };
    let _: Ack = signed(&keys_b)
        .post(&format!("http://{}", agent_b.addr()), paths::REGISTER_CLIENT, &data)
        .await
        .unwrap();

    let seen = eventually(Duration::from_secs(10), || async {
        endpoints_up(&agent_b, &viewer, viewer_node)
            .await
            .is_ok_and(|list| list.iter().any(|e| e.netid == pastiche.netid))
    })
    .await;
    assert!(seen, "B never saw A's endpoint");

    let removed = coordinator.state().remove_rule("viewer-pastiche", "sharks").await.unwrap();
    assert_eq!(removed, 1);

    let hidden = eventually(tick * 2 + Duration::from_secs(3), || async {
        matches!(
            endpoints_up(&agent_b, &viewer, viewer_node).await,
            Err(TetherError::NotFound(_))
        )
    })
    .await;
    assert!(hidden, "A's endpoint stayed visible after the rule was removed");

    agent_b.shutdown().await;
    agent_a.shutdown().await;
    coordinator.shutdown().await;
}

/// A restarted agent keeps its coordinator and relays what it missed
#[tokio::test]
async fn scenario_agent_restart_resumes_from_disk() {
    let keys = Arc::new(KeyPair::generate(services::STEWARD_REV, "fleetadmin").unwrap());
    let flock = FlockKey::generate();
    let coordinator = Coordinator::start(
        coordinator_settings(Duration::from_millis(300), vec![]),
        keys.clone(),
        flock.clone(),
    )
    .await
    .unwrap();

    let dir = TempDir::new().unwrap();
    let agent_keys = Arc::new(KeyPair::generate(services::REEVE_REV, "PR").unwrap());
    let agent = Agent::start(agent_settings(&coordinator, dir.path(), "nodeR", "PR"), agent_keys.clone(), flock.clone())
        .await
        .unwrap();
    assert!(dir.path().join("coordinator.json").exists());
    agent.shutdown().await;

    let agent = Agent::start(agent_settings(&coordinator, dir.path(), "nodeR", "PR"), agent_keys, flock)
        .await
        .unwrap();
    assert_eq!(
        agent.state().coordinator.get().await.unwrap().keyid,
        keys.key_id().to_string()
    );

    let db = coordinator.state().db.clone();
    let registered = eventually(Duration::from_secs(5), || {
        let db = db.clone();
        async move { db.count_live_endpoints().unwrap() == 1 && db.count_live_clients().unwrap() == 1 }
    })
    .await;
    assert!(registered);

    agent.shutdown().await;
    coordinator.shutdown().await;
}

/// A restarted coordinator keeps trusting the agents that joined it before
#[tokio::test]
async fn scenario_coordinator_restart_keeps_agents_trusted() {
    let keys = Arc::new(KeyPair::generate(services::STEWARD_REV, "fleetadmin").unwrap());
    let flock = FlockKey::generate();
    let db_dir = TempDir::new().unwrap();
    let mut settings = coordinator_settings(Duration::from_millis(300), vec![]);
    settings.db_path = Some(db_dir.path().join("registry.db"));
    let coordinator = Coordinator::start(settings.clone(), keys.clone(), flock.clone())
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let agent_keys = Arc::new(KeyPair::generate(services::REEVE_REV, "PQ").unwrap());
    let saved = agent_settings(&coordinator, dir.path(), "nodeQ", "PQ");
    let agent = Agent::start(saved.clone(), agent_keys.clone(), flock.clone()).await.unwrap();
    let db = coordinator.state().db.clone();
    let announced = eventually(Duration::from_secs(5), || {
        let db = db.clone();
        async move { db.count_live_endpoints().unwrap() == 1 }
    })
    .await;
    assert!(announced);
    drop(db);

    settings.steward_addr = coordinator.steward_addr().to_string();
    settings.registry_addr = coordinator.registry_addr().to_string();
    agent.shutdown().await;
    coordinator.shutdown().await;

    let coordinator = Coordinator::start(settings, keys, flock.clone()).await.unwrap();
    assert!(
        coordinator
            .state()
            .authority
            .whitelist()
            .contains(&agent_keys.key_id().to_string())
            .await
    );
    let agent = Agent::start(saved, agent_keys.clone(), flock).await.unwrap();

    let pastiche = endpoint("sharks", "Pastiche", "PQ", 7201);
    let _: Ack = signed(&agent_keys)
        .post(&format!("http://{}", agent.addr()), paths::REGISTER_ENDPOINT, &pastiche)
        .await
        .unwrap();
    let local = local_uuid(&pastiche.netid).to_string();
    let endpoints = agent.state().endpoints.clone();
    let completed = eventually(Duration::from_secs(5), || {
        let endpoints = endpoints.clone();
        let local = local.clone();
        async move { endpoints.state_of(&local).await == Some(RecordState::Completed) }
    })
    .await;
    assert!(completed, "relay after the restart did not complete");

    let db = coordinator.state().db.clone();
    let netid = pastiche.netid.clone();
    let landed = eventually(Duration::from_secs(5), || {
        let db = db.clone();
        let netid = netid.clone();
        async move { db.gather_catalog().unwrap().iter().any(|c| c.info.netid == netid) }
    })
    .await;
    assert!(landed, "endpoint never reached the restarted registry");

    agent.shutdown().await;
    coordinator.shutdown().await;
}
