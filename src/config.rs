use crate::breaker::BreakerConfig;
use crate::broker::MqttBrokerSettings;
use crate::queue_depth::ManagementEndpoint;
use crate::system::PipelineSettings;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/energy-pipeline/config.json";
const MAX_RECOVERY_CONCURRENCY: usize = 10;

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("ENERGY_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    management_url: Option<String>,
    #[serde(default)]
    forecaster_url: Option<String>,
    #[serde(default)]
    burst_size: Option<usize>,
    #[serde(default)]
    tick_interval_ms: Option<u64>,
    #[serde(default)]
    breaker_failure_threshold: Option<usize>,
    #[serde(default)]
    breaker_cooldown_ms: Option<u64>,
    #[serde(default)]
    history_window: Option<usize>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Values from the setup file only apply where the matching env var is unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_set: impl Fn(&str) -> bool,
) {
    if !env_set("ENERGY_MQTT_HOST") {
        if let Some(host) = non_blank(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if !env_set("ENERGY_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if !env_set("ENERGY_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_blank(Some(username));
        }
    }
    if !env_set("ENERGY_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_blank(Some(password));
        }
    }
    if !env_set("ENERGY_MANAGEMENT_URL") {
        if let Some(url) = non_blank(overrides.management_url.as_deref()) {
            config.management_url = Some(url);
        }
    }
    if !env_set("ENERGY_FORECASTER_URL") {
        if let Some(url) = non_blank(overrides.forecaster_url.as_deref()) {
            config.forecaster_url = Some(url);
        }
    }
    if !env_set("ENERGY_BURST_SIZE") {
        if let Some(value) = overrides.burst_size.filter(|v| *v != 0) {
            config.burst_size = value;
        }
    }
    if !env_set("ENERGY_TICK_INTERVAL_MS") {
        if let Some(value) = overrides.tick_interval_ms.filter(|v| *v != 0) {
            config.tick_interval_ms = value;
        }
    }
    if !env_set("ENERGY_BREAKER_FAILURE_THRESHOLD") {
        if let Some(value) = overrides.breaker_failure_threshold.filter(|v| *v != 0) {
            config.breaker_failure_threshold = value;
        }
    }
    if !env_set("ENERGY_BREAKER_COOLDOWN_MS") {
        if let Some(value) = overrides.breaker_cooldown_ms.filter(|v| *v != 0) {
            config.breaker_cooldown_ms = value;
        }
    }
    if !env_set("ENERGY_HISTORY_WINDOW") {
        if let Some(value) = overrides.history_window.filter(|v| *v != 0) {
            config.history_window = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub store_timeout_ms: u64,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub fallback_topic: String,
    pub dead_letter_topic: String,
    pub publish_timeout_ms: u64,
    pub delivery_limit: u32,
    pub requeue_delay_ms: u64,
    pub recovery_concurrency: usize,
    pub management_url: Option<String>,
    pub management_username: String,
    pub management_password: String,
    pub management_vhost: String,
    pub fallback_queue: String,
    pub depth_timeout_ms: u64,
    pub breaker_window: usize,
    pub breaker_failure_threshold: usize,
    pub breaker_cooldown_ms: u64,
    pub breaker_half_open_calls: usize,
    pub burst_size: usize,
    pub tick_interval_ms: u64,
    pub http_bind: String,
    pub forecaster_url: Option<String>,
    pub forecaster_timeout_ms: u64,
    pub history_window: usize,
    pub purge_on_startup: bool,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env_string("ENERGY_DATABASE_URL")
            .or_else(|| env_string("DATABASE_URL"))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| non_blank(ov.database_url.as_deref()))
            })
            .context("ENERGY_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let mqtt_client_id = env_string("ENERGY_MQTT_CLIENT_ID")
            .unwrap_or_else(|| "energy-pipeline-recovery".to_string());
        let fallback_queue = env_string("ENERGY_FALLBACK_QUEUE")
            .unwrap_or_else(|| format!("mqtt-subscription-{mqtt_client_id}qos1"));

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("ENERGY_DB_POOL_SIZE", 10),
            store_timeout_ms: env_parse("ENERGY_STORE_TIMEOUT_MS", 3_000),
            mqtt_host: env_string("ENERGY_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: env_parse("ENERGY_MQTT_PORT", 1883),
            mqtt_username: env_string("ENERGY_MQTT_USERNAME"),
            mqtt_password: env_string("ENERGY_MQTT_PASSWORD"),
            mqtt_client_id,
            mqtt_keepalive_secs: env_parse("ENERGY_MQTT_KEEPALIVE_SECS", 30),
            fallback_topic: env_string("ENERGY_FALLBACK_TOPIC")
                .unwrap_or_else(|| "energy/fallback/readings".to_string()),
            dead_letter_topic: env_string("ENERGY_DEAD_LETTER_TOPIC")
                .unwrap_or_else(|| "energy/fallback/readings/dlq".to_string()),
            publish_timeout_ms: env_parse("ENERGY_PUBLISH_TIMEOUT_MS", 2_000),
            delivery_limit: env_parse("ENERGY_DELIVERY_LIMIT", 1_000),
            requeue_delay_ms: env_parse("ENERGY_REQUEUE_DELAY_MS", 1_000),
            recovery_concurrency: env_parse("ENERGY_RECOVERY_CONCURRENCY", 5),
            management_url: env_string("ENERGY_MANAGEMENT_URL"),
            management_username: env_string("ENERGY_MANAGEMENT_USERNAME")
                .unwrap_or_else(|| "guest".to_string()),
            management_password: env_string("ENERGY_MANAGEMENT_PASSWORD")
                .unwrap_or_else(|| "guest".to_string()),
            management_vhost: env_string("ENERGY_MANAGEMENT_VHOST").unwrap_or_else(|| "/".to_string()),
            fallback_queue,
            depth_timeout_ms: env_parse("ENERGY_DEPTH_TIMEOUT_MS", 1_500),
            breaker_window: env_parse("ENERGY_BREAKER_WINDOW", 10),
            breaker_failure_threshold: env_parse("ENERGY_BREAKER_FAILURE_THRESHOLD", 5),
            breaker_cooldown_ms: env_parse("ENERGY_BREAKER_COOLDOWN_MS", 10_000),
            breaker_half_open_calls: env_parse("ENERGY_BREAKER_HALF_OPEN_CALLS", 1),
            burst_size: env_parse("ENERGY_BURST_SIZE", 24),
            tick_interval_ms: env_parse("ENERGY_TICK_INTERVAL_MS", 2_000),
            http_bind: env_string("ENERGY_HTTP_BIND").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            forecaster_url: env_string("ENERGY_FORECASTER_URL"),
            forecaster_timeout_ms: env_parse("ENERGY_FORECASTER_TIMEOUT_MS", 1_500),
            history_window: env_parse("ENERGY_HISTORY_WINDOW", 100),
            purge_on_startup: env::var("ENERGY_PURGE_ON_STARTUP")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            otlp_endpoint: env_string("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, env_is_set);
        }
        config.recovery_concurrency = config.recovery_concurrency.clamp(1, MAX_RECOVERY_CONCURRENCY);

        Ok(config)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn depth_timeout(&self) -> Duration {
        Duration::from_millis(self.depth_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn forecaster_timeout(&self) -> Duration {
        Duration::from_millis(self.forecaster_timeout_ms)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            window: self.breaker_window,
            failure_threshold: self.breaker_failure_threshold,
            cooldown: self.breaker_cooldown(),
            half_open_calls: self.breaker_half_open_calls,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            breaker: self.breaker_config(),
            burst_size: self.burst_size.max(1),
            tick_interval: self.tick_interval(),
            recovery_concurrency: self.recovery_concurrency,
            history_window: self.history_window.max(self.burst_size),
            ..PipelineSettings::default()
        }
    }

    pub fn mqtt_settings(&self) -> MqttBrokerSettings {
        MqttBrokerSettings {
            client_id: self.mqtt_client_id.clone(),
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            keepalive: Duration::from_secs(self.mqtt_keepalive_secs),
            topic: self.fallback_topic.clone(),
            dead_letter_topic: self.dead_letter_topic.clone(),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            delivery_limit: self.delivery_limit.max(1),
            requeue_delay: Duration::from_millis(self.requeue_delay_ms),
            delivery_buffer: self.recovery_concurrency * 4,
        }
    }

    pub fn management_endpoint(&self) -> Option<ManagementEndpoint> {
        self.management_url.as_ref().map(|base_url| ManagementEndpoint {
            base_url: base_url.trim_end_matches('/').to_string(),
            vhost: self.management_vhost.clone(),
            queue: self.fallback_queue.clone(),
            username: self.management_username.clone(),
            password: self.management_password.clone(),
        })
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
