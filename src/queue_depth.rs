use crate::broker::FallbackBroker;
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Broker management API coordinates for the fallback queue.
#[derive(Debug, Clone)]
pub struct ManagementEndpoint {
    pub base_url: String,
    pub vhost: String,
    pub queue: String,
    pub username: String,
    pub password: String,
}

impl ManagementEndpoint {
    fn queues_url(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2F".to_string()
        } else {
            self.vhost.replace('/', "%2F")
        };
        format!("{}/api/queues/{}", self.base_url.trim_end_matches('/'), vhost)
    }
}

/// Reports the fallback queue backlog used for write routing.
pub struct QueueDepthMonitor {
    client: Client,
    management: Option<ManagementEndpoint>,
    broker: Arc<dyn FallbackBroker>,
    timeout: Duration,
}

impl QueueDepthMonitor {
    pub fn new(
        broker: Arc<dyn FallbackBroker>,
        management: Option<ManagementEndpoint>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            management,
            broker,
            timeout,
        }
    }

    /// Ready plus unacknowledged messages. Never fails: any error reads as an
    /// empty backlog so direct writes resume rather than stall.
    pub async fn total_backlog(&self) -> u64 {
        if let Some(endpoint) = &self.management {
            match self.query_management(endpoint).await {
                Ok(Some(total)) => return total,
                Ok(None) => {
                    tracing::debug!(queue = %endpoint.queue, "fallback queue not listed by management api");
                }
                Err(err) => {
                    tracing::debug!(error=%err, "management api unavailable; using passive depth");
                }
            }
        }

        match tokio::time::timeout(self.timeout, self.broker.ready_count()).await {
            Ok(Ok(ready)) => ready,
            Ok(Err(err)) => {
                tracing::debug!(error=%err, "passive queue depth failed; assuming empty backlog");
                0
            }
            Err(_) => {
                tracing::debug!("passive queue depth timed out; assuming empty backlog");
                0
            }
        }
    }

    async fn query_management(&self, endpoint: &ManagementEndpoint) -> Result<Option<u64>> {
        let response = self
            .client
            .get(endpoint.queues_url())
            .basic_auth(&endpoint.username, Some(&endpoint.password))
            .send()
            .await
            .context("management request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("management api returned {}", response.status()));
        }
        let body: Value = response.json().await.context("management response was not json")?;
        Ok(backlog_from_queues(&body, &endpoint.queue))
    }
}

/// Picks the named queue out of a management `/api/queues/{vhost}` listing.
pub fn backlog_from_queues(body: &Value, queue: &str) -> Option<u64> {
    let entry = body
        .as_array()?
        .iter()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(queue))?;
    let count = |key: &str| entry.get(key).and_then(Value::as_u64).unwrap_or(0);
    let messages = count("messages");
    if messages > 0 {
        return Some(messages);
    }
    Some(count("messages_ready") + count("messages_unacknowledged"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryBroker;
    use serde_json::json;

    #[test]
    fn backlog_prefers_total_messages() {
        let body = json!([
            {"name": "other", "messages": 99},
            {"name": "energy_fallback_queue", "messages": 7, "messages_ready": 5, "messages_unacknowledged": 2}
        ]);
        assert_eq!(backlog_from_queues(&body, "energy_fallback_queue"), Some(7));
    }

    #[test]
    fn backlog_sums_ready_and_unacked_when_total_missing() {
        let body = json!([
            {"name": "energy_fallback_queue", "messages_ready": 3, "messages_unacknowledged": 4}
        ]);
        assert_eq!(backlog_from_queues(&body, "energy_fallback_queue"), Some(7));
        assert_eq!(backlog_from_queues(&body, "missing"), None);
        assert_eq!(backlog_from_queues(&json!({"error": "x"}), "missing"), None);
    }

    #[test]
    fn default_vhost_is_encoded() {
        let endpoint = ManagementEndpoint {
            base_url: "http://rabbit:15672/".into(),
            vhost: "/".into(),
            queue: "q".into(),
            username: "guest".into(),
            password: "guest".into(),
        };
        assert_eq!(endpoint.queues_url(), "http://rabbit:15672/api/queues/%2F");
    }

    #[tokio::test]
    async fn passive_fallback_reports_ready_messages() {
        let broker = Arc::new(MemoryBroker::new(10));
        broker.seed_ready(3);
        let monitor = QueueDepthMonitor::new(broker.clone(), None, Duration::from_millis(200));
        assert_eq!(monitor.total_backlog().await, 3);
    }

    #[tokio::test]
    async fn errors_collapse_to_zero() {
        let broker = Arc::new(MemoryBroker::new(10));
        broker.seed_ready(3);
        broker.set_reachable(false);
        let monitor = QueueDepthMonitor::new(
            broker.clone(),
            Some(ManagementEndpoint {
                base_url: "http://127.0.0.1:9".into(),
                vhost: "/".into(),
                queue: "q".into(),
                username: "guest".into(),
                password: "guest".into(),
            }),
            Duration::from_millis(200),
        );
        assert_eq!(monitor.total_backlog().await, 0);
    }
}
