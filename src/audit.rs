use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide tallies for the current ingestion batch.
#[derive(Debug, Default)]
pub struct AuditCounters {
    csv_total: AtomicU64,
    sent_to_queue: AtomicU64,
    received_from_queue: AtomicU64,
    saved_direct: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditSnapshot {
    pub csv_total: u64,
    pub sent_to_queue: u64,
    pub received_from_queue: u64,
    pub saved_direct: u64,
}

impl AuditSnapshot {
    /// What the store should hold if every recovered and direct write landed once.
    pub fn estimated_store_total(&self) -> u64 {
        self.received_from_queue + self.saved_direct
    }

    pub fn awaiting_recovery(&self) -> u64 {
        self.sent_to_queue.saturating_sub(self.received_from_queue)
    }
}

impl AuditCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, csv_total: u64) {
        self.csv_total.store(csv_total, Ordering::Relaxed);
        self.sent_to_queue.store(0, Ordering::Relaxed);
        self.received_from_queue.store(0, Ordering::Relaxed);
        self.saved_direct.store(0, Ordering::Relaxed);
        tracing::info!(csv_total, "audit counters reset for new batch");
    }

    pub fn record_sent(&self) -> u64 {
        self.sent_to_queue.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_received(&self) -> u64 {
        self.received_from_queue.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_direct(&self) -> u64 {
        self.saved_direct.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> AuditSnapshot {
        AuditSnapshot {
            csv_total: self.csv_total.load(Ordering::Relaxed),
            sent_to_queue: self.sent_to_queue.load(Ordering::Relaxed),
            received_from_queue: self.received_from_queue.load(Ordering::Relaxed),
            saved_direct: self.saved_direct.load(Ordering::Relaxed),
        }
    }

    pub fn log_status(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            csv_total = snapshot.csv_total,
            sent_to_queue = snapshot.sent_to_queue,
            received_from_queue = snapshot.received_from_queue,
            saved_direct = snapshot.saved_direct,
            estimated_store_total = snapshot.estimated_store_total(),
            "audit status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_tallies_and_sets_total() {
        let audit = AuditCounters::new();
        audit.record_direct();
        audit.record_sent();
        audit.record_sent();
        audit.record_received();

        let before = audit.snapshot();
        assert_eq!(before.estimated_store_total(), 2);
        assert_eq!(before.awaiting_recovery(), 1);

        audit.reset(30);
        assert_eq!(
            audit.snapshot(),
            AuditSnapshot {
                csv_total: 30,
                ..AuditSnapshot::default()
            }
        );
    }
}
