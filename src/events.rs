use crate::reading::Reading;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Direct,
    Recovered,
}

/// Fired exactly once for every reading that reached the store.
#[derive(Debug, Clone)]
pub struct PersistedEvent {
    pub reading: Reading,
    pub origin: Origin,
}

#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<PersistedEvent>,
}

pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<PersistedEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    pub fn persisted(&self, reading: Reading, origin: Origin) {
        if self.tx.send(PersistedEvent { reading, origin }).is_err() {
            tracing::debug!(?origin, "no consumer for persisted events");
        }
    }
}
