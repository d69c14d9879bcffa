//! Fan-out of reports to live push subscribers.
//!
//! Each subscriber owns a bounded channel. Broadcasting snapshots the
//! registry, then uses `try_send` on every sink so a slow or closed
//! subscriber never blocks the publisher; any failed push removes that sink.
//! A subscription deregisters itself when dropped, which covers client
//! disconnects, stream completion and timeouts.

use crate::analytics::SystemReport;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

type Sink = mpsc::Sender<Arc<SystemReport>>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<u64, Sink>>,
}

impl Registry {
    fn sinks(&self) -> MutexGuard<'_, HashMap<u64, Sink>> {
        self.sinks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: u64) -> bool {
        self.sinks().remove(&id).is_some()
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.registry.sinks().insert(id, tx);
        tracing::info!(subscriber = id, total = self.subscriber_count(), "subscriber registered");
        Subscription {
            id,
            rx,
            registry: self.registry.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.sinks().len()
    }

    /// Pushes `report` to every live sink; returns how many accepted it.
    pub fn broadcast(&self, report: Arc<SystemReport>) -> usize {
        let snapshot: Vec<(u64, Sink)> = self
            .registry
            .sinks()
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect();

        let mut delivered = 0;
        for (id, sink) in snapshot {
            match sink.try_send(report.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    if self.registry.remove(id) {
                        tracing::info!(subscriber = id, error=%err, "push failed; subscriber removed");
                    }
                }
            }
        }
        delivered
    }
}

/// Stream of reports for one subscriber.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<SystemReport>>,
    registry: Arc<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Stream for Subscription {
    type Item = Arc<SystemReport>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.registry.remove(self.id) {
            tracing::info!(subscriber = self.id, "subscriber disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{GlobalStats, Insights};
    use crate::audit::AuditSnapshot;
    use crate::breaker::CircuitState;
    use crate::events::Origin;
    use crate::test_support::sample_reading;
    use futures::StreamExt;

    fn report(consumption: f64) -> Arc<SystemReport> {
        Arc::new(SystemReport {
            generated_at: chrono::Utc::now(),
            origin: Origin::Direct,
            latest: sample_reading("r", consumption),
            recent: Vec::new(),
            stats: GlobalStats::default(),
            insights: Insights {
                predicted_consumption: None,
                deviation: None,
                anomaly: false,
                message: String::new(),
                suggestion: String::new(),
            },
            audit: AuditSnapshot::default(),
            circuit_state: CircuitState::Closed,
        })
    }

    #[tokio::test]
    async fn reports_reach_every_subscriber_in_order() {
        let broadcaster = Broadcaster::new(8);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        assert_eq!(broadcaster.broadcast(report(1.0)), 2);
        assert_eq!(broadcaster.broadcast(report(2.0)), 2);

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.next().await.unwrap().latest.energy_consumption, 1.0);
            assert_eq!(sub.next().await.unwrap().latest.energy_consumption, 2.0);
        }
    }

    #[tokio::test]
    async fn failed_push_removes_the_subscriber() {
        let broadcaster = Broadcaster::new(1);
        let mut slow = broadcaster.subscribe();
        let mut healthy = broadcaster.subscribe();

        assert_eq!(broadcaster.broadcast(report(1.0)), 2);
        healthy.next().await.unwrap();

        // `slow` never drained its single slot, so this push fails.
        assert_eq!(broadcaster.broadcast(report(2.0)), 1);
        assert_eq!(broadcaster.subscriber_count(), 1);
        healthy.next().await.unwrap();

        assert_eq!(broadcaster.broadcast(report(3.0)), 1);
        assert_eq!(slow.next().await.unwrap().latest.energy_consumption, 1.0);
        assert!(slow.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_deregisters_it() {
        let broadcaster = Broadcaster::new(4);
        let subscription = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(broadcaster.broadcast(report(1.0)), 0);
    }
}
