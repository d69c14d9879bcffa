//! Durable fallback queue: message envelope, delivery settlement and the
//! broker abstraction the gateway and recovery consumer talk to.

pub mod mqtt;

use crate::error::BrokerError;
use crate::reading::Reading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

pub use mqtt::{MqttBroker, MqttBrokerSettings};

/// Provenance tag for writes deferred while older fallback messages drain.
pub const SOURCE_RECOVERY_PRIORITY: &str = "recovery-priority";
/// Provenance tag for writes that failed or were short-circuited by the breaker.
pub const SOURCE_CIRCUIT_FALLBACK: &str = "circuit-breaker-fallback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackMessage {
    /// Message identity; equal to the reading's correlation id.
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    pub source: String,
    #[serde(default)]
    pub failure_count: u64,
    /// Number of times the broker has already handed this message out.
    #[serde(default)]
    pub delivery_count: u32,
    pub published_at: DateTime<Utc>,
    pub reading: Reading,
}

fn default_persistent() -> bool {
    true
}

impl FallbackMessage {
    pub fn new(reading: Reading, source: &str, failure_count: u64) -> Self {
        Self {
            message_id: reading.correlation_id().map(str::to_string),
            persistent: true,
            source: source.to_string(),
            failure_count,
            delivery_count: 0,
            published_at: Utc::now(),
            reading,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &mut [u8]) -> Result<Self, BrokerError> {
        simd_json::serde::from_slice(payload).map_err(|err| BrokerError::Decode(err.to_string()))
    }
}

/// How a delivered message is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

/// Requeues past the delivery limit turn into dead letters.
pub fn apply_delivery_limit(disposition: Disposition, delivery_count: u32, limit: u32) -> Disposition {
    match disposition {
        Disposition::Requeue if delivery_count.saturating_add(1) >= limit => Disposition::DeadLetter,
        other => other,
    }
}

/// One message handed to the recovery consumer. Dropping it unsettled
/// counts as a requeue.
#[derive(Debug)]
pub struct Delivery {
    pub message: FallbackMessage,
    settle: oneshot::Sender<Disposition>,
}

impl Delivery {
    pub fn new(message: FallbackMessage) -> (Self, oneshot::Receiver<Disposition>) {
        let (settle, rx) = oneshot::channel();
        (Self { message, settle }, rx)
    }

    pub fn into_parts(self) -> (FallbackMessage, Settle) {
        (self.message, Settle(self.settle))
    }
}

#[derive(Debug)]
pub struct Settle(oneshot::Sender<Disposition>);

impl Settle {
    pub fn send(self, disposition: Disposition) {
        if self.0.send(disposition).is_err() {
            tracing::debug!(?disposition, "broker no longer waiting for settlement");
        }
    }
}

/// Resolves what the adapter should do once a delivery is settled or abandoned.
pub async fn await_settlement(rx: oneshot::Receiver<Disposition>) -> Disposition {
    rx.await.unwrap_or(Disposition::Requeue)
}

#[async_trait]
pub trait FallbackBroker: Send + Sync {
    /// Persistent, at-least-once publish to the fallback queue.
    async fn publish(&self, message: &FallbackMessage) -> Result<(), BrokerError>;

    /// Passive backlog count over the messaging protocol itself. Reports only
    /// messages still waiting for delivery; unacknowledged ones are not seen.
    async fn ready_count(&self) -> Result<u64, BrokerError>;
}
