//! StateClock batching of inbound agent records.
//!
//! Records are appended to an in-memory list as they arrive. Every tick the
//! list is swapped out and handed, together with its `StateClock`, to an
//! `IntervalSink`; the clock then advances. Ticks with nothing queued do not
//! advance the clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use tether_common::{ClientData, EndpointData, KeyId, TetherError};

/// Identity and wall-clock bounds of one batching interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateClock {
    pub state: i64,
    /// First record of the interval
    pub begin: Option<DateTime<Utc>>,
    /// When the interval was closed
    pub end: Option<DateTime<Utc>>,
}

/// One inbound record, tagged with its transaction id and signer
#[derive(Debug, Clone)]
pub enum IngestRecord {
    Client {
        tx_uuid: String,
        signer: KeyId,
        data: ClientData,
    },
    Endpoint {
        tx_uuid: String,
        signer: KeyId,
        data: EndpointData,
    },
}

impl IngestRecord {
    pub fn tx_uuid(&self) -> &str {
        match self {
            IngestRecord::Client { tx_uuid, .. } | IngestRecord::Endpoint { tx_uuid, .. } => tx_uuid,
        }
    }

    pub fn signer(&self) -> &KeyId {
        match self {
            IngestRecord::Client { signer, .. } | IngestRecord::Endpoint { signer, .. } => signer,
        }
    }
}

/// What a caller gets back for an accepted record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub tx_uuid: String,
    pub state: i64,
}

/// Receives each closed interval
#[async_trait]
pub trait IntervalSink: Send + Sync {
    async fn persist(&self, batch: Vec<IngestRecord>, clock: StateClock) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Pending {
    records: Vec<IngestRecord>,
    begin: Option<DateTime<Utc>>,
}

pub struct Ingest {
    pending: Arc<Mutex<Pending>>,
    accepting: Arc<AtomicBool>,
    state: Arc<AtomicI64>,
    stop_tx: mpsc::Sender<()>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Ingest {
    /// Start the ticker at StateClock `first_state`
    pub fn start(tick: Duration, first_state: i64, sink: Arc<dyn IntervalSink>) -> Self {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let state = Arc::new(AtomicI64::new(first_state));
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let task = tokio::spawn(ticker_loop(tick, pending.clone(), state.clone(), sink, stop_rx));
        info!(state = first_state, tick_ms = tick.as_millis() as u64, "⏱️ Ingest started");

        Self {
            pending,
            accepting: Arc::new(AtomicBool::new(true)),
            state,
            stop_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// StateClock of the interval currently accumulating
    pub fn current_state(&self) -> i64 {
        self.state.load(Ordering::SeqCst)
    }

    fn append(&self, make: impl FnOnce(String) -> IngestRecord) -> Result<IngestReceipt, TetherError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TetherError::FailedPrecondition("ingest is stopped".into()));
        }
        let tx_uuid = Uuid::new_v4().to_string();
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| TetherError::Internal("ingest list lock poisoned".into()))?;
        if pending.records.is_empty() {
            pending.begin = Some(Utc::now());
        }
        pending.records.push(make(tx_uuid.clone()));
        Ok(IngestReceipt {
            tx_uuid,
            state: self.current_state(),
        })
    }

    pub fn ingest_client(&self, data: ClientData, signer: KeyId) -> Result<IngestReceipt, TetherError> {
        self.append(|tx_uuid| IngestRecord::Client { tx_uuid, signer, data })
    }

    pub fn ingest_endpoint(&self, data: EndpointData, signer: KeyId) -> Result<IngestReceipt, TetherError> {
        self.append(|tx_uuid| IngestRecord::Endpoint { tx_uuid, signer, data })
    }

    /// Stop ticking, refuse new records, and wait for an in-flight persist.
    ///
    /// Records still queued are dropped.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
        self.accepting.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Ingest task ended abnormally");
            }
        }
        let dropped = self.pending.lock().map(|p| p.records.len()).unwrap_or(0);
        info!(dropped, "🛑 Ingest stopped");
    }
}

async fn ticker_loop(
    tick: Duration,
    pending: Arc<Mutex<Pending>>,
    state: Arc<AtomicI64>,
    sink: Arc<dyn IntervalSink>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                let taken = match pending.lock() {
                    Ok(mut guard) => std::mem::take(&mut *guard),
                    Err(_) => {
                        error!("Ingest list lock poisoned");
                        break;
                    }
                };
                if taken.records.is_empty() {
                    continue;
                }

                let clock = StateClock {
                    state: state.load(Ordering::SeqCst),
                    begin: taken.begin,
                    end: Some(Utc::now()),
                };
                debug!(state = clock.state, records = taken.records.len(), "Closing interval");
                if let Err(e) = sink.persist(taken.records, clock.clone()).await {
                    error!(state = clock.state, error = %e, "Failed to persist interval");
                }
                state.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct Recorder {
        batches: AsyncMutex<Vec<(StateClock, Vec<String>)>>,
    }

    #[async_trait]
    impl IntervalSink for Recorder {
        async fn persist(&self, batch: Vec<IngestRecord>, clock: StateClock) -> anyhow::Result<()> {
            let ids = batch.iter().map(|r| r.tx_uuid().to_string()).collect();
            self.batches.lock().await.push((clock, ids));
            Ok(())
        }
    }

    fn signer() -> KeyId {
        crate::signing::KeyPair::generate("Reeve1", "P")
            .unwrap()
            .key_id()
            .clone()
    }

    #[tokio::test]
    async fn test_batches_are_disjoint_and_clock_advances() {
        let recorder = Arc::new(Recorder::default());
        let ingest = Ingest::start(Duration::from_millis(100), 1, recorder.clone());
        let who = signer();

        let mut sent = Vec::new();
        for _ in 0..5 {
            sent.push(ingest.ingest_client(ClientData::default(), who.clone()).unwrap().tx_uuid);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        for _ in 0..3 {
            sent.push(ingest.ingest_endpoint(EndpointData::default(), who.clone()).unwrap().tx_uuid);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        ingest.stop().await;

        let batches = recorder.batches.lock().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0.state, 1);
        assert_eq!(batches[1].0.state, 2);
        assert!(batches.iter().all(|(c, _)| c.begin.is_some() && c.end.is_some()));

        let mut seen: Vec<String> = batches.iter().flat_map(|(_, ids)| ids.clone()).collect();
        assert_eq!(seen.len(), sent.len());
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), sent.len());
    }

    #[tokio::test]
    async fn test_empty_ticks_do_not_advance() {
        let recorder = Arc::new(Recorder::default());
        let ingest = Ingest::start(Duration::from_millis(50), 7, recorder.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ingest.current_state(), 7);
        ingest.stop().await;
        assert!(recorder.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_ingest_refuses_records() {
        let ingest = Ingest::start(Duration::from_millis(50), 1, Arc::new(Recorder::default()));
        ingest.stop().await;
        let err = ingest.ingest_client(ClientData::default(), signer()).unwrap_err();
        assert!(matches!(err, TetherError::FailedPrecondition(_)));
    }
}
