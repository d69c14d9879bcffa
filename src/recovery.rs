use crate::audit::AuditCounters;
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::broker::{Delivery, Disposition, FallbackMessage};
use crate::error::RecoveryFailure;
use crate::events::{EventSender, Origin};
use crate::store::ReadingStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Stored,
    /// Already in the store; absorbed without a rewrite.
    Duplicate,
    /// No message identity; unrecoverable.
    MissingId,
    Requeued(RecoveryFailure),
}

impl RecoveryOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            RecoveryOutcome::Stored | RecoveryOutcome::Duplicate | RecoveryOutcome::MissingId => {
                Disposition::Ack
            }
            RecoveryOutcome::Requeued(_) => Disposition::Requeue,
        }
    }
}

/// Drains fallback deliveries back into the store.
pub struct RecoveryConsumer {
    store: Arc<dyn ReadingStore>,
    breaker: Arc<CircuitBreaker>,
    audit: Arc<AuditCounters>,
    events: EventSender,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes a message id from the in-flight set when processing ends.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.id);
    }
}

impl RecoveryConsumer {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        breaker: Arc<CircuitBreaker>,
        audit: Arc<AuditCounters>,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            breaker,
            audit,
            events,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            id: id.to_string(),
        })
    }

    pub async fn on_message(&self, message: FallbackMessage) -> RecoveryOutcome {
        let Some(message_id) = message.message_id().map(str::to_string) else {
            tracing::error!(
                source = %message.source,
                "fallback message has no message id; dropping unrecoverable reading"
            );
            return RecoveryOutcome::MissingId;
        };
        let Some(_guard) = self.claim(&message_id) else {
            tracing::debug!(%message_id, "message already being processed; requeueing copy");
            return RecoveryOutcome::Requeued(RecoveryFailure::InFlight);
        };

        let mut reading = message.reading;
        let correlation_id = match reading.correlation_id() {
            Some(id) => id.to_string(),
            None => {
                reading.correlation_id = Some(message_id.clone());
                message_id.clone()
            }
        };

        // An open circuit means the store is assumed unreachable, so the
        // existence check is skipped and the guarded save short-circuits.
        if self.breaker.state() != CircuitState::Open {
            match self
                .breaker
                .call(self.store.exists_by_correlation_id(&correlation_id))
                .await
            {
                Ok(true) => {
                    tracing::warn!(%message_id, %correlation_id, "duplicate fallback delivery; already stored");
                    return RecoveryOutcome::Duplicate;
                }
                Ok(false) => {}
                Err(err) => return self.requeue(&message_id, err.into()),
            }
        }

        match self.breaker.call(self.store.save(&reading)).await {
            Ok(true) => {
                let received = self.audit.record_received();
                tracing::info!(
                    %message_id,
                    source = %message.source,
                    deliveries = message.delivery_count + 1,
                    received,
                    "recovered reading saved to store"
                );
                self.events.persisted(reading, Origin::Recovered);
                RecoveryOutcome::Stored
            }
            Ok(false) => {
                tracing::warn!(%message_id, %correlation_id, "duplicate fallback delivery; already stored");
                RecoveryOutcome::Duplicate
            }
            Err(err) => self.requeue(&message_id, err.into()),
        }
    }

    fn requeue(&self, message_id: &str, failure: RecoveryFailure) -> RecoveryOutcome {
        tracing::warn!(%message_id, reason = failure.reason(), "recovery failed; message will be redelivered");
        RecoveryOutcome::Requeued(failure)
    }

    /// Processes one delivery and settles it with the broker.
    pub async fn handle(&self, delivery: Delivery) {
        let (message, settle) = delivery.into_parts();
        let outcome = self.on_message(message).await;
        settle.send(outcome.disposition());
    }

    /// Consumes deliveries with at most `concurrency` messages in progress.
    pub fn spawn(self: Arc<Self>, mut deliveries: mpsc::Receiver<Delivery>, concurrency: usize) -> JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let consumer = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    consumer.handle(delivery).await;
                });
            }
            tracing::info!("fallback delivery stream closed; recovery consumer exiting");
        })
    }
}
