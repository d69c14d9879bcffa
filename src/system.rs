//! Control surface over the pipeline: ingest, start, stop, subscribe and
//! status, plus the wiring that connects the components.

use crate::analytics::{Analytics, AnalyticsSettings, SystemReport};
use crate::audit::{AuditCounters, AuditSnapshot};
use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::broadcast::{Broadcaster, Subscription};
use crate::broker::{Delivery, FallbackBroker};
use crate::error::ControlError;
use crate::events;
use crate::forecast::Forecaster;
use crate::gateway::PersistenceGateway;
use crate::ingest::parse_csv;
use crate::queue_depth::QueueDepthMonitor;
use crate::recovery::RecoveryConsumer;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::store::ReadingStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub breaker: BreakerConfig,
    pub burst_size: usize,
    pub tick_interval: Duration,
    pub recovery_concurrency: usize,
    pub history_window: usize,
    pub subscriber_buffer: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            burst_size: 24,
            tick_interval: Duration::from_secs(2),
            recovery_concurrency: 5,
            history_window: 100,
            subscriber_buffer: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub loaded: usize,
    pub purged: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub scheduler: SchedulerState,
    pub pending: usize,
    pub circuit_state: CircuitState,
    pub backlog: u64,
    pub record_count: u64,
    pub consecutive_failures: u64,
    pub subscribers: usize,
    pub audit: AuditSnapshot,
    pub last_report: Option<Arc<SystemReport>>,
}

/// Background tasks started by [`EnergySystem::assemble`].
pub struct Workers {
    pub timer: JoinHandle<()>,
    pub recovery: JoinHandle<()>,
    pub analytics: JoinHandle<()>,
}

impl Workers {
    pub fn abort(&self) {
        self.timer.abort();
        self.recovery.abort();
        self.analytics.abort();
    }
}

pub struct EnergySystem {
    store: Arc<dyn ReadingStore>,
    gateway: Arc<PersistenceGateway>,
    scheduler: Arc<Scheduler>,
    analytics: Arc<Analytics>,
    broadcaster: Broadcaster,
    audit: Arc<AuditCounters>,
    breaker: Arc<CircuitBreaker>,
    depth: Arc<QueueDepthMonitor>,
}

impl EnergySystem {
    /// Builds every component around the given collaborators and starts the
    /// scheduler timer, the recovery worker pool and the analytics consumer.
    pub fn assemble(
        store: Arc<dyn ReadingStore>,
        broker: Arc<dyn FallbackBroker>,
        deliveries: mpsc::Receiver<Delivery>,
        depth: Arc<QueueDepthMonitor>,
        forecaster: Arc<dyn Forecaster>,
        settings: PipelineSettings,
    ) -> (Arc<Self>, Workers) {
        let breaker = Arc::new(CircuitBreaker::new("store", settings.breaker.clone()));
        let audit = Arc::new(AuditCounters::new());
        let (event_tx, event_rx) = events::channel();

        let gateway = Arc::new(PersistenceGateway::new(
            store.clone(),
            broker,
            depth.clone(),
            breaker.clone(),
            audit.clone(),
            event_tx.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            gateway.clone(),
            settings.burst_size,
            settings.tick_interval,
        ));
        let recovery = Arc::new(RecoveryConsumer::new(
            store.clone(),
            breaker.clone(),
            audit.clone(),
            event_tx,
        ));
        let analytics = Arc::new(Analytics::new(
            store.clone(),
            breaker.clone(),
            forecaster,
            audit.clone(),
            AnalyticsSettings {
                history_window: settings.history_window,
                min_history: settings.burst_size,
            },
        ));
        let broadcaster = Broadcaster::new(settings.subscriber_buffer);

        let workers = Workers {
            timer: scheduler.clone().spawn_timer(),
            recovery: recovery.spawn(deliveries, settings.recovery_concurrency),
            analytics: analytics.clone().spawn(event_rx, broadcaster.clone()),
        };

        let system = Arc::new(Self {
            store,
            gateway,
            scheduler,
            analytics,
            broadcaster,
            audit,
            breaker,
            depth,
        });
        (system, workers)
    }

    /// Replaces the dataset: purges the store, resets counters and loads the
    /// parsed readings into the pending queue.
    pub async fn ingest(&self, upload: &[u8]) -> Result<IngestSummary, ControlError> {
        let readings = parse_csv(upload)?;
        if readings.is_empty() {
            return Err(ControlError::EmptyUpload);
        }
        let purged = self.store.delete_all().await?;
        let loaded = readings.len();
        self.audit.reset(loaded as u64);
        self.analytics.reset();
        self.scheduler.load_queue(readings);
        tracing::info!(loaded, purged, "dataset ingested");
        Ok(IngestSummary { loaded, purged })
    }

    pub async fn start(&self) -> Result<SchedulerState, ControlError> {
        self.scheduler.start().await
    }

    pub fn stop(&self) {
        self.scheduler.stop();
        self.audit.log_status();
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn last_report(&self) -> Option<Arc<SystemReport>> {
        self.analytics.last_report()
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            scheduler: self.scheduler.state(),
            pending: self.scheduler.pending(),
            circuit_state: self.breaker.state(),
            backlog: self.depth.total_backlog().await,
            record_count: self.gateway.record_count().await,
            consecutive_failures: self.gateway.consecutive_failures(),
            subscribers: self.broadcaster.subscriber_count(),
            audit: self.audit.snapshot(),
            last_report: self.analytics.last_report(),
        }
    }

    /// Stops emission and wipes stored readings and derived state.
    pub async fn clear_all(&self) -> Result<u64, ControlError> {
        self.scheduler.stop();
        self.scheduler.clear_queue();
        let purged = self.store.delete_all().await?;
        self.audit.reset(0);
        self.analytics.reset();
        tracing::info!(purged, "all data cleared");
        Ok(purged)
    }
}
