use super::{
    apply_delivery_limit, await_settlement, Delivery, Disposition, FallbackBroker, FallbackMessage,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Publish, QoS};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct MqttBrokerSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
    pub topic: String,
    pub dead_letter_topic: String,
    pub publish_timeout: Duration,
    pub delivery_limit: u32,
    pub requeue_delay: Duration,
    pub delivery_buffer: usize,
}

/// Fallback queue on top of an MQTT broker.
///
/// The session is persistent (`clean_session = false`) and every publish uses
/// QoS 1, so queued readings survive both a process restart and a broker
/// restart. Acknowledgements are manual: a message is only acked once the
/// recovery consumer settles it. A requeue republishes the message with an
/// incremented delivery count before acking the original, which is how the
/// delivery limit is enforced on a protocol that has no native counter.
///
/// Publishes issued before the first `ConnAck` are handed to the client's
/// request queue and bounded by `publish_timeout`. Once a connection has been
/// established and then lost, publishes fail fast as unreachable.
#[derive(Clone)]
pub struct MqttBroker {
    client: AsyncClient,
    settings: Arc<MqttBrokerSettings>,
    connected: Arc<AtomicBool>,
    has_connected: Arc<AtomicBool>,
    outstanding: Arc<Outstanding>,
}

/// Ids of messages this process published that are not settled yet.
///
/// Messages left over from an earlier run are never recorded, so settling
/// them does not offset publishes made by this run.
#[derive(Debug, Default)]
struct Outstanding {
    ids: Mutex<HashSet<String>>,
}

impl Outstanding {
    fn record(&self, id: &str) {
        self.lock().insert(id.to_string());
    }

    fn settle(&self, id: &str) -> bool {
        self.lock().remove(id)
    }

    fn len(&self) -> u64 {
        self.lock().len() as u64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn mqtt_options(settings: &MqttBrokerSettings) -> MqttOptions {
    let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    options.set_keep_alive(settings.keepalive);
    options.set_clean_session(false);
    options.set_manual_acks(true);
    if let Some(username) = &settings.username {
        options.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
    }
    options
}

impl MqttBroker {
    fn new(settings: MqttBrokerSettings) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(&settings), 64);
        let broker = Self {
            client,
            settings: Arc::new(settings),
            connected: Arc::new(AtomicBool::new(false)),
            has_connected: Arc::new(AtomicBool::new(false)),
            outstanding: Arc::new(Outstanding::default()),
        };
        (broker, eventloop)
    }

    pub fn connect(settings: MqttBrokerSettings) -> (Self, mpsc::Receiver<Delivery>, JoinHandle<()>) {
        let (delivery_tx, delivery_rx) = mpsc::channel(settings.delivery_buffer.max(1));
        let (broker, mut eventloop) = Self::new(settings);

        let worker = broker.clone();
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        worker.connected.store(true, Ordering::Relaxed);
                        worker.has_connected.store(true, Ordering::Relaxed);
                        tracing::info!(
                            host = %worker.settings.host,
                            session_present = ack.session_present,
                            "fallback broker connected"
                        );
                        if !ack.session_present {
                            if let Err(err) = worker
                                .client
                                .try_subscribe(worker.settings.topic.clone(), QoS::AtLeastOnce)
                            {
                                tracing::warn!(error=%err, "failed to subscribe to fallback queue");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if publish.topic != worker.settings.topic {
                            let _ = worker.client.try_ack(&publish);
                            continue;
                        }
                        let handler = worker.clone();
                        let tx = delivery_tx.clone();
                        tokio::spawn(async move { handler.dispatch(publish, tx).await });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        worker.connected.store(false, Ordering::Relaxed);
                        tracing::warn!(error=%err, "fallback broker connection dropped; reconnecting");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        (broker, delivery_rx, handle)
    }

    async fn dispatch(&self, publish: Publish, deliveries: mpsc::Sender<Delivery>) {
        let mut payload = publish.payload.to_vec();
        let message = match FallbackMessage::decode(&mut payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(error=%err, topic=%publish.topic, "undecodable fallback message; dead-lettering");
                if self.send_raw(&self.settings.dead_letter_topic, publish.payload.to_vec()).await.is_ok() {
                    self.ack(&publish).await;
                }
                return;
            }
        };

        let delivery_count = message.delivery_count;
        let (delivery, settled) = Delivery::new(message.clone());
        if deliveries.send(delivery).await.is_err() {
            tracing::warn!("recovery consumer stopped; leaving fallback message unacknowledged");
            return;
        }
        let disposition = apply_delivery_limit(
            await_settlement(settled).await,
            delivery_count,
            self.settings.delivery_limit,
        );

        match disposition {
            Disposition::Ack => {}
            Disposition::Requeue => {
                sleep(self.settings.requeue_delay).await;
                let republished = match requeued(&message).encode() {
                    Ok(bytes) => self.send_raw(&self.settings.topic, bytes).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = republished {
                    tracing::warn!(
                        error=%err,
                        message_id = message.message_id().unwrap_or("-"),
                        "failed to requeue fallback message; broker will redeliver"
                    );
                    return;
                }
                // The republished copy stays outstanding under the same id.
                self.ack(&publish).await;
                return;
            }
            Disposition::DeadLetter => {
                let moved = match message.encode() {
                    Ok(bytes) => self.send_raw(&self.settings.dead_letter_topic, bytes).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = moved {
                    tracing::warn!(error=%err, "failed to dead-letter fallback message; broker will redeliver");
                    return;
                }
                tracing::error!(
                    message_id = message.message_id().unwrap_or("-"),
                    correlation_id = message.reading.correlation_id().unwrap_or("-"),
                    deliveries = delivery_count + 1,
                    dead_letter_topic = %self.settings.dead_letter_topic,
                    "fallback message exceeded delivery limit; moved to dead-letter queue"
                );
            }
        }

        if let Some(id) = message.message_id() {
            self.outstanding.settle(id);
        }
        self.ack(&publish).await;
    }

    async fn ack(&self, publish: &Publish) {
        if let Err(err) = self.client.ack(publish).await {
            tracing::warn!(error=%err, "failed to ack fallback message");
        }
    }

    fn link_lost(&self) -> bool {
        self.has_connected.load(Ordering::Relaxed) && !self.connected.load(Ordering::Relaxed)
    }

    async fn send_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.link_lost() {
            return Err(BrokerError::Unreachable(format!(
                "not connected to {}:{}",
                self.settings.host, self.settings.port
            )));
        }
        match tokio::time::timeout(
            self.settings.publish_timeout,
            self.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BrokerError::Publish(err.to_string())),
            Err(_) => Err(BrokerError::Timeout(self.settings.publish_timeout)),
        }
    }
}

fn requeued(message: &FallbackMessage) -> FallbackMessage {
    FallbackMessage {
        delivery_count: message.delivery_count.saturating_add(1),
        ..message.clone()
    }
}

#[async_trait]
impl FallbackBroker for MqttBroker {
    async fn publish(&self, message: &FallbackMessage) -> Result<(), BrokerError> {
        let payload = message.encode()?;
        self.send_raw(&self.settings.topic, payload).await?;
        if let Some(id) = message.message_id() {
            self.outstanding.record(id);
        }
        Ok(())
    }

    /// MQTT has no passive queue inspection; this reports messages published
    /// by this process that have not been settled yet.
    async fn ready_count(&self) -> Result<u64, BrokerError> {
        if self.link_lost() {
            return Err(BrokerError::Unreachable("fallback broker disconnected".to_string()));
        }
        Ok(self.outstanding.len())
    }
}
