use crate::audit::{AuditCounters, AuditSnapshot};
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::broadcast::Broadcaster;
use crate::events::{Origin, PersistedEvent};
use crate::forecast::Forecaster;
use crate::reading::Reading;
use crate::store::ReadingStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Mean absolute error of the reference consumption model, in kWh.
pub const MODEL_MAE_KWH: f64 = 3.91;
/// Deviations beyond this many MAEs are flagged as anomalies.
pub const ANOMALY_FACTOR: f64 = 2.5;

const LOW_OCCUPANCY: i32 = 5;
const RENEWABLE_SURPLUS: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct AnalyticsSettings {
    /// Readings fetched from the store for each forecast.
    pub history_window: usize,
    /// History required before the forecaster is consulted.
    pub min_history: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GlobalStats {
    pub average_temperature: f64,
    pub total_energy_consumption: f64,
    pub peak_load: f64,
    pub total_records: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insights {
    pub predicted_consumption: Option<f64>,
    pub deviation: Option<f64>,
    pub anomaly: bool,
    pub message: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemReport {
    pub generated_at: DateTime<Utc>,
    pub origin: Origin,
    pub latest: Reading,
    pub recent: Vec<Reading>,
    pub stats: GlobalStats,
    pub insights: Insights,
    pub audit: AuditSnapshot,
    pub circuit_state: CircuitState,
}

#[derive(Debug, Default)]
struct RunningStats {
    count: u64,
    temperature_sum: f64,
    energy_sum: f64,
    peak: f64,
}

impl RunningStats {
    fn add(&mut self, reading: &Reading) {
        self.count += 1;
        self.temperature_sum += reading.temperature;
        self.energy_sum += reading.energy_consumption;
        if reading.energy_consumption > self.peak {
            self.peak = reading.energy_consumption;
        }
    }

    fn snapshot(&self) -> GlobalStats {
        if self.count == 0 {
            return GlobalStats::default();
        }
        GlobalStats {
            average_temperature: self.temperature_sum / self.count as f64,
            total_energy_consumption: self.energy_sum,
            peak_load: self.peak,
            total_records: self.count,
        }
    }
}

/// Turns persisted readings into reports for live subscribers.
pub struct Analytics {
    store: Arc<dyn ReadingStore>,
    breaker: Arc<CircuitBreaker>,
    forecaster: Arc<dyn Forecaster>,
    audit: Arc<AuditCounters>,
    settings: AnalyticsSettings,
    stats: Mutex<RunningStats>,
    history: Mutex<VecDeque<Reading>>,
    last_report: Mutex<Option<Arc<SystemReport>>>,
}

impl Analytics {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        breaker: Arc<CircuitBreaker>,
        forecaster: Arc<dyn Forecaster>,
        audit: Arc<AuditCounters>,
        settings: AnalyticsSettings,
    ) -> Self {
        Self {
            store,
            breaker,
            forecaster,
            audit,
            settings,
            stats: Mutex::new(RunningStats::default()),
            history: Mutex::new(VecDeque::new()),
            last_report: Mutex::new(None),
        }
    }

    pub fn last_report(&self) -> Option<Arc<SystemReport>> {
        self.last_report.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn reset(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = RunningStats::default();
        }
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
        if let Ok(mut last) = self.last_report.lock() {
            *last = None;
        }
    }

    /// Newest first; the store is preferred, the local window covers outages.
    async fn recent_history(&self) -> Vec<Reading> {
        if self.breaker.state() != CircuitState::Open {
            match self
                .breaker
                .call(self.store.find_recent(self.settings.history_window))
                .await
            {
                Ok(rows) => return rows,
                Err(err) => {
                    tracing::debug!(error=%err, "history query failed; using local window");
                }
            }
        }
        self.history
            .lock()
            .map(|history| history.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn on_persisted(&self, event: PersistedEvent) -> Arc<SystemReport> {
        let stats = match self.stats.lock() {
            Ok(mut stats) => {
                stats.add(&event.reading);
                stats.snapshot()
            }
            Err(_) => GlobalStats::default(),
        };
        if let Ok(mut history) = self.history.lock() {
            history.push_back(event.reading.clone());
            while history.len() > self.settings.history_window.max(1) {
                history.pop_front();
            }
        }

        let history = self.recent_history().await;
        let insights = self.insights(&event.reading, &history).await;
        let report = Arc::new(SystemReport {
            generated_at: Utc::now(),
            origin: event.origin,
            latest: event.reading,
            recent: history.into_iter().take(self.settings.min_history.max(1)).collect(),
            stats,
            insights,
            audit: self.audit.snapshot(),
            circuit_state: self.breaker.state(),
        });
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report.clone());
        }
        report
    }

    async fn insights(&self, latest: &Reading, history: &[Reading]) -> Insights {
        if history.len() < self.settings.min_history {
            return Insights {
                predicted_consumption: None,
                deviation: None,
                anomaly: false,
                message: format!(
                    "system initializing (buffer {}/{})",
                    history.len(),
                    self.settings.min_history
                ),
                suggestion: String::new(),
            };
        }

        let predicted = match self.forecaster.predict(history).await {
            Ok(predicted) => predicted,
            Err(err) => {
                tracing::warn!(error=%err, forecaster = self.forecaster.name(), "forecast unavailable");
                return Insights {
                    predicted_consumption: None,
                    deviation: None,
                    anomaly: false,
                    message: "forecaster offline".to_string(),
                    suggestion: String::new(),
                };
            }
        };

        let actual = latest.energy_consumption;
        let deviation = (actual - predicted).abs();
        let anomaly = deviation > MODEL_MAE_KWH * ANOMALY_FACTOR;
        if anomaly {
            tracing::warn!(
                correlation_id = latest.correlation_id().unwrap_or("-"),
                actual,
                predicted,
                deviation,
                "consumption anomaly detected"
            );
        }
        let message = if anomaly {
            format!("anomaly: consumption deviates {deviation:.2} kWh from forecast")
        } else {
            "consumption within forecast tolerance".to_string()
        };
        Insights {
            predicted_consumption: Some(predicted),
            deviation: Some(deviation),
            anomaly,
            message,
            suggestion: suggestion(latest, predicted),
        }
    }

    /// Consumes persisted events in order and pushes each report to subscribers.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PersistedEvent>,
        broadcaster: Broadcaster,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let report = self.on_persisted(event).await;
                let delivered = broadcaster.broadcast(report);
                tracing::debug!(delivered, "report broadcast");
            }
        })
    }
}

fn suggestion(latest: &Reading, predicted: f64) -> String {
    if latest.occupancy < LOW_OCCUPANCY && latest.hvac_state.eq_ignore_ascii_case("on") {
        return "high draw in a nearly empty building: switch HVAC to eco mode".to_string();
    }
    if latest.occupancy < LOW_OCCUPANCY {
        return "high draw in a nearly empty building: check lighting and standby loads".to_string();
    }
    if latest.renewable_energy > RENEWABLE_SURPLUS && latest.energy_consumption > predicted {
        return "renewable surplus available: shift flexible loads into this window".to_string();
    }
    "operating in line with forecast baseline".to_string()
}
