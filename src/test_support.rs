use crate::audit::AuditCounters;
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::broker::{
    apply_delivery_limit, await_settlement, Delivery, Disposition, FallbackBroker, FallbackMessage,
};
use crate::error::{BrokerError, StoreError};
use crate::events::{self, PersistedEvent};
use crate::gateway::PersistenceGateway;
use crate::queue_depth::QueueDepthMonitor;
use crate::reading::Reading;
use crate::recovery::RecoveryConsumer;
use crate::store::ReadingStore;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub fn sample_reading(correlation_id: &str, consumption: f64) -> Reading {
    Reading {
        correlation_id: if correlation_id.is_empty() {
            None
        } else {
            Some(correlation_id.to_string())
        },
        timestamp: NaiveDate::from_ymd_opt(2026, 1, 5).and_then(|d| d.and_hms_opt(8, 0, 0)),
        temperature: 22.5,
        humidity: 41.0,
        square_footage: 1450.0,
        occupancy: 12,
        hvac_state: "On".into(),
        lighting_state: "On".into(),
        renewable_energy: 6.0,
        day_of_week: "Monday".into(),
        holiday_flag: "No".into(),
        energy_consumption: consumption,
    }
}

/// Readings without correlation ids, as a fresh upload would produce.
pub fn synthetic_batch(n: usize) -> Vec<Reading> {
    (0..n)
        .map(|i| sample_reading("", 70.0 + (i % 7) as f64))
        .collect()
}

/// In-memory store with failure injection.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Reading>>,
    down: AtomicBool,
    fail_next_saves: AtomicU64,
    pub save_calls: AtomicU64,
    pub exists_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next_saves(&self, n: u64) {
        self.fail_next_saves.store(n, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<Reading> {
        self.rows.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn rows_with_id(&self, id: &str) -> usize {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.correlation_id() == Some(id))
            .count()
    }

    pub fn insert_raw(&self, reading: Reading) {
        self.rows.lock().unwrap().push(reading);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn save(&self, reading: &Reading) -> Result<bool, StoreError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let injected = self
            .fail_next_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Timeout(std::time::Duration::from_secs(3)));
        }
        let id = reading
            .correlation_id()
            .ok_or_else(|| StoreError::Generic("missing correlation id".into()))?;
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.correlation_id() == Some(id)) {
            return Ok(false);
        }
        rows.push(reading.clone());
        Ok(true)
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<Reading>, StoreError> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.correlation_id() == Some(correlation_id))
            .cloned())
    }

    async fn exists_by_correlation_id(&self, correlation_id: &str) -> Result<bool, StoreError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.find_by_correlation_id(correlation_id).await?.is_some())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.len() as u64)
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        self.check()?;
        Ok(self.rows.lock().unwrap().iter().rev().take(limit).cloned().collect())
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }
}

/// In-memory fallback queue with ready/unacked accounting, redelivery
/// counting and a dead-letter list.
pub struct MemoryBroker {
    ready: Mutex<VecDeque<FallbackMessage>>,
    dead_letters: Mutex<Vec<FallbackMessage>>,
    reachable: AtomicBool,
    unacked: AtomicU64,
    delivery_limit: u32,
    pub published: AtomicU64,
}

impl MemoryBroker {
    pub fn new(delivery_limit: u32) -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            unacked: AtomicU64::new(0),
            delivery_limit,
            published: AtomicU64::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn seed_ready(&self, n: usize) {
        let mut ready = self.ready.lock().unwrap();
        for i in 0..n {
            ready.push_back(FallbackMessage::new(
                sample_reading(&format!("seed-{i}"), 60.0),
                crate::broker::SOURCE_CIRCUIT_FALLBACK,
                1,
            ));
        }
    }

    pub fn push_raw(&self, message: FallbackMessage) {
        self.ready.lock().unwrap().push_back(message);
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    pub fn ready_messages(&self) -> Vec<FallbackMessage> {
        self.ready.lock().unwrap().iter().cloned().collect()
    }

    pub fn take_ready(&self) -> Vec<FallbackMessage> {
        self.ready.lock().unwrap().drain(..).collect()
    }

    pub fn dead_letters(&self) -> Vec<FallbackMessage> {
        self.dead_letters.lock().unwrap().clone()
    }

    /// Hands every currently ready message to the consumer once and applies
    /// the resulting dispositions. Returns the number of deliveries made.
    pub async fn pump(&self, consumer: &RecoveryConsumer) -> usize {
        let batch: Vec<FallbackMessage> = self.ready.lock().unwrap().drain(..).collect();
        let delivered = batch.len();
        for message in batch {
            self.unacked.fetch_add(1, Ordering::SeqCst);
            let (delivery, settled) = Delivery::new(message.clone());
            consumer.handle(delivery).await;
            let disposition = apply_delivery_limit(
                await_settlement(settled).await,
                message.delivery_count,
                self.delivery_limit,
            );
            self.unacked.fetch_sub(1, Ordering::SeqCst);
            match disposition {
                Disposition::Ack => {}
                Disposition::Requeue => {
                    let mut next = message;
                    next.delivery_count += 1;
                    self.ready.lock().unwrap().push_back(next);
                }
                Disposition::DeadLetter => self.dead_letters.lock().unwrap().push(message),
            }
        }
        delivered
    }

    /// Pumps until the queue is empty or `max_rounds` passes were made.
    pub async fn drain(&self, consumer: &RecoveryConsumer, max_rounds: usize) {
        for _ in 0..max_rounds {
            if self.pump(consumer).await == 0 {
                break;
            }
        }
    }

    /// Moves every ready message into a delivery channel, as a push-based
    /// broker would, and settles them in the background.
    pub fn deliver_all(self: &Arc<Self>, tx: tokio::sync::mpsc::Sender<Delivery>) {
        let batch: Vec<FallbackMessage> = self.ready.lock().unwrap().drain(..).collect();
        for message in batch {
            let broker = self.clone();
            let tx = tx.clone();
            self.unacked.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (delivery, settled) = Delivery::new(message.clone());
                if tx.send(delivery).await.is_err() {
                    return;
                }
                let disposition = apply_delivery_limit(
                    await_settlement(settled).await,
                    message.delivery_count,
                    broker.delivery_limit,
                );
                broker.unacked.fetch_sub(1, Ordering::SeqCst);
                match disposition {
                    Disposition::Ack => {}
                    Disposition::Requeue => {
                        let mut next = message;
                        next.delivery_count += 1;
                        broker.ready.lock().unwrap().push_back(next);
                    }
                    Disposition::DeadLetter => broker.dead_letters.lock().unwrap().push(message),
                }
            });
        }
    }

    pub fn unacked(&self) -> u64 {
        self.unacked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FallbackBroker for MemoryBroker {
    async fn publish(&self, message: &FallbackMessage) -> Result<(), BrokerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("memory broker offline".into()));
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        self.ready.lock().unwrap().push_back(message.clone());
        Ok(())
    }

    async fn ready_count(&self) -> Result<u64, BrokerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("memory broker offline".into()));
        }
        Ok(self.ready_len() as u64)
    }
}

/// Gateway wired to in-memory collaborators.
pub struct GatewayFixture {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
    pub breaker: Arc<CircuitBreaker>,
    pub audit: Arc<AuditCounters>,
    pub gateway: Arc<PersistenceGateway>,
    pub events: UnboundedReceiver<PersistedEvent>,
}

pub fn breaker_config(failure_threshold: usize, cooldown: Duration) -> BreakerConfig {
    BreakerConfig {
        window: 10,
        failure_threshold,
        cooldown,
        half_open_calls: 1,
    }
}

pub fn gateway_fixture(failure_threshold: usize) -> GatewayFixture {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new(10));
    let breaker = Arc::new(CircuitBreaker::new(
        "store",
        breaker_config(failure_threshold, Duration::from_secs(30)),
    ));
    let audit = Arc::new(AuditCounters::new());
    let depth = Arc::new(QueueDepthMonitor::new(
        broker.clone(),
        None,
        Duration::from_millis(100),
    ));
    let (tx, rx) = events::channel();
    let gateway = Arc::new(PersistenceGateway::new(
        store.clone(),
        broker.clone(),
        depth,
        breaker.clone(),
        audit.clone(),
        tx,
    ));
    GatewayFixture {
        store,
        broker,
        breaker,
        audit,
        gateway,
        events: rx,
    }
}
