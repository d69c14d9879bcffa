use crate::audit::AuditCounters;
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::broker::{FallbackBroker, FallbackMessage, SOURCE_CIRCUIT_FALLBACK, SOURCE_RECOVERY_PRIORITY};
use crate::error::BreakerError;
use crate::events::{EventSender, Origin};
use crate::queue_depth::QueueDepthMonitor;
use crate::reading::Reading;
use crate::store::ReadingStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cumulative failure counts at which a failure is logged at error level.
const ALERT_EVERY: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Stored,
    Queued { source: &'static str },
    /// Store and broker both unavailable; the reading is lost.
    Dropped,
}

/// Single-record writer in front of the store.
pub struct PersistenceGateway {
    store: Arc<dyn ReadingStore>,
    broker: Arc<dyn FallbackBroker>,
    depth: Arc<QueueDepthMonitor>,
    breaker: Arc<CircuitBreaker>,
    audit: Arc<AuditCounters>,
    events: EventSender,
    consecutive_failures: AtomicU64,
}

impl PersistenceGateway {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        broker: Arc<dyn FallbackBroker>,
        depth: Arc<QueueDepthMonitor>,
        breaker: Arc<CircuitBreaker>,
        audit: Arc<AuditCounters>,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            broker,
            depth,
            breaker,
            audit,
            events,
            consecutive_failures: AtomicU64::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub async fn save(&self, mut reading: Reading) -> SaveOutcome {
        let correlation_id = reading.ensure_identity();

        // While older readings sit in the fallback queue, new ones join them so
        // recovery stays the only write lane until the backlog is gone.
        if self.breaker.state() != CircuitState::Open {
            let backlog = self.depth.total_backlog().await;
            if backlog > 0 {
                tracing::debug!(%correlation_id, backlog, "backlog pending; deferring write to fallback queue");
                return self.send_to_fallback(reading, SOURCE_RECOVERY_PRIORITY).await;
            }
        }

        match self.breaker.call(self.store.save(&reading)).await {
            Ok(inserted) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if inserted {
                    self.audit.record_direct();
                    tracing::info!(%correlation_id, "reading saved to store");
                    self.events.persisted(reading, Origin::Direct);
                } else {
                    tracing::warn!(%correlation_id, "reading already stored; skipping duplicate");
                }
                SaveOutcome::Stored
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let reason = match &err {
                    BreakerError::Open => "CIRCUIT_OPEN",
                    BreakerError::Inner(inner) => inner.reason(),
                };
                if failures == 1 || failures % ALERT_EVERY == 0 {
                    tracing::error!(%correlation_id, failures, reason, error=%err, "store write failed; routing to fallback queue");
                } else {
                    tracing::debug!(%correlation_id, failures, reason, "store write failed; routing to fallback queue");
                }
                self.send_to_fallback(reading, SOURCE_CIRCUIT_FALLBACK).await
            }
        }
    }

    async fn send_to_fallback(&self, reading: Reading, source: &'static str) -> SaveOutcome {
        let failures = self.consecutive_failures();
        let message = FallbackMessage::new(reading, source, failures);
        match self.broker.publish(&message).await {
            Ok(()) => {
                let sent = self.audit.record_sent();
                tracing::info!(
                    message_id = message.message_id().unwrap_or("-"),
                    source,
                    sent,
                    "reading sent to fallback queue"
                );
                SaveOutcome::Queued { source }
            }
            Err(err) => {
                tracing::error!(
                    error=%err,
                    message_id = message.message_id().unwrap_or("-"),
                    source,
                    failures,
                    "critical data loss risk: fallback broker unreachable while store unavailable; reading dropped"
                );
                SaveOutcome::Dropped
            }
        }
    }

    /// Store row count, or the locally tracked estimate while the store is
    /// unavailable.
    pub async fn record_count(&self) -> u64 {
        if self.breaker.state() != CircuitState::Open {
            match self.breaker.call(self.store.count()).await {
                Ok(count) => return count,
                Err(err) => {
                    tracing::warn!(error=%err, "record count query failed; using local estimate");
                }
            }
        }
        self.audit.snapshot().estimated_store_total()
    }
}
