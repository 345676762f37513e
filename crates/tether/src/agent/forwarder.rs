//! Relays locally accepted records to the coordinator.
//!
//! Two bounded queues, one per record kind, feed a single task. Each relay
//! produces a `RelayOutcome` on the outcome channel; the forwarder never
//! touches the record store itself.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_common::{Ack, ClientData, EndpointData, TetherError};

use crate::rpc::CoordinatorApi;

/// A record waiting to be relayed
#[derive(Debug, Clone)]
pub enum Relay {
    Client { local: String, data: ClientData },
    Endpoint { local: String, data: EndpointData },
}

impl Relay {
    pub fn local(&self) -> &str {
        match self {
            Relay::Client { local, .. } | Relay::Endpoint { local, .. } => local,
        }
    }
}

/// Result of relaying one record
#[derive(Debug)]
pub struct RelayOutcome {
    pub relay: Relay,
    pub result: Result<Ack, TetherError>,
}

pub struct Forwarder {
    clients: mpsc::Sender<Relay>,
    endpoints: mpsc::Sender<Relay>,
    stop_tx: mpsc::Sender<()>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Forwarder {
    pub fn start(
        coordinator: Arc<dyn CoordinatorApi>,
        queue: usize,
        outcomes: mpsc::Sender<RelayOutcome>,
    ) -> Self {
        let (clients, client_rx) = mpsc::channel(queue.max(1));
        let (endpoints, endpoint_rx) = mpsc::channel(queue.max(1));
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(relay_loop(coordinator, client_rx, endpoint_rx, stop_rx, outcomes));
        Self {
            clients,
            endpoints,
            stop_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Queue a record, waiting for room
    pub async fn send(&self, relay: Relay) -> Result<(), TetherError> {
        let queue = match relay {
            Relay::Client { .. } => &self.clients,
            Relay::Endpoint { .. } => &self.endpoints,
        };
        queue
            .send(relay)
            .await
            .map_err(|_| TetherError::FailedPrecondition("forwarder is stopped".into()))
    }

    /// Stop relaying; queued records stay pending in the store
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn relay_one(coordinator: &dyn CoordinatorApi, relay: Relay) -> RelayOutcome {
    let result = match &relay {
        Relay::Client { data, .. } => coordinator.client_update(data).await,
        Relay::Endpoint { data, .. } => coordinator.endpoint_update(data).await,
    };
    match &result {
        Ok(ack) => debug!(local = relay.local(), remote = %ack.remoteuuid, "Relayed record"),
        Err(e) => warn!(local = relay.local(), error = %e, "Relay failed"),
    }
    RelayOutcome { relay, result }
}

async fn relay_loop(
    coordinator: Arc<dyn CoordinatorApi>,
    mut clients: mpsc::Receiver<Relay>,
    mut endpoints: mpsc::Receiver<Relay>,
    mut stop_rx: mpsc::Receiver<()>,
    outcomes: mpsc::Sender<RelayOutcome>,
) {
    loop {
        let relay = tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            Some(relay) = clients.recv() => relay,
            Some(relay) = endpoints.recv() => relay,
            else => break,
        };
        let outcome = relay_one(coordinator.as_ref(), relay).await;
        if outcomes.send(outcome).await.is_err() {
            break;
        }
    }
    clients.close();
    endpoints.close();
    info!("🛑 Forwarder stopped");
}
