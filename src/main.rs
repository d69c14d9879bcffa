use anyhow::{Context, Result};
use energy_pipeline::broker::MqttBroker;
use energy_pipeline::config::Config;
use energy_pipeline::forecast::{Forecaster, HttpForecaster, MovingAverageForecaster};
use energy_pipeline::http::{router, HttpState};
use energy_pipeline::queue_depth::QueueDepthMonitor;
use energy_pipeline::store::postgres::build_pool;
use energy_pipeline::store::PgReadingStore;
use energy_pipeline::system::EnergySystem;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,energy_pipeline=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "energy-pipeline"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size, config.store_timeout()).await?;
    let store = Arc::new(PgReadingStore::new(pool, config.store_timeout()));
    if let Err(err) = store.ensure_schema().await {
        tracing::warn!(error=%err, "failed to ensure schema; store may be unavailable");
    }

    let (broker, deliveries, broker_handle) = MqttBroker::connect(config.mqtt_settings());
    let broker = Arc::new(broker);
    let depth = Arc::new(QueueDepthMonitor::new(
        broker.clone(),
        config.management_endpoint(),
        config.depth_timeout(),
    ));
    let forecaster: Arc<dyn Forecaster> = match &config.forecaster_url {
        Some(url) => Arc::new(HttpForecaster::new(url.clone(), config.forecaster_timeout())),
        None => Arc::new(MovingAverageForecaster::default()),
    };
    tracing::info!(forecaster = forecaster.name(), "forecaster selected");

    let (system, workers) = EnergySystem::assemble(
        store,
        broker,
        deliveries,
        depth,
        forecaster,
        config.pipeline_settings(),
    );

    if config.purge_on_startup {
        match system.clear_all().await {
            Ok(purged) => tracing::info!(purged, "startup purge complete"),
            Err(err) => tracing::warn!(error=%err, "startup purge failed"),
        }
    }

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "http control surface listening");
    let app = router(HttpState {
        system: system.clone(),
    });
    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        res = http_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "http server exited"),
                Err(err) => tracing::error!(error=%err, "http task failed"),
                Ok(Ok(())) => {}
            }
        }
        res = broker_handle => {
            if let Err(err) = res { tracing::error!(error=%err, "fallback broker task failed"); }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    system.stop();
    workers.abort();

    Ok(())
}
