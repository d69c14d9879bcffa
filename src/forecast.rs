use crate::error::ForecastError;
use crate::reading::Reading;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Readings the moving-average baseline looks back over.
pub const DEFAULT_LOOKBACK: usize = 12;

#[async_trait]
pub trait Forecaster: Send + Sync {
    /// Predicts the next consumption value from history ordered newest first.
    async fn predict(&self, history: &[Reading]) -> Result<f64, ForecastError>;

    fn name(&self) -> &'static str;
}

pub struct MovingAverageForecaster {
    lookback: usize,
}

impl MovingAverageForecaster {
    pub fn new(lookback: usize) -> Self {
        Self {
            lookback: lookback.max(1),
        }
    }
}

impl Default for MovingAverageForecaster {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKBACK)
    }
}

#[async_trait]
impl Forecaster for MovingAverageForecaster {
    async fn predict(&self, history: &[Reading]) -> Result<f64, ForecastError> {
        if history.len() < self.lookback {
            return Err(ForecastError::InsufficientHistory {
                have: history.len(),
                need: self.lookback,
            });
        }
        let window = &history[..self.lookback];
        let total: f64 = window.iter().map(|r| r.energy_consumption).sum();
        Ok(total / window.len() as f64)
    }

    fn name(&self) -> &'static str {
        "moving-average"
    }
}

#[derive(Serialize)]
struct PredictSample<'a> {
    timestamp: Option<NaiveDateTime>,
    temperature: f64,
    humidity: f64,
    square_footage: f64,
    occupancy: i32,
    hvac_state: &'a str,
    lighting_state: &'a str,
    renewable_energy: f64,
    day_of_week: &'a str,
    holiday_flag: &'a str,
    energy_consumption: f64,
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    history: Vec<PredictSample<'a>>,
}

#[derive(Deserialize)]
struct PredictResponse {
    prediction: f64,
}

/// Remote model service; the request carries oldest-first history.
pub struct HttpForecaster {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpForecaster {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl Forecaster for HttpForecaster {
    async fn predict(&self, history: &[Reading]) -> Result<f64, ForecastError> {
        let payload = PredictRequest {
            history: history
                .iter()
                .rev()
                .map(|r| PredictSample {
                    timestamp: r.timestamp,
                    temperature: r.temperature,
                    humidity: r.humidity,
                    square_footage: r.square_footage,
                    occupancy: r.occupancy,
                    hvac_state: &r.hvac_state,
                    lighting_state: &r.lighting_state,
                    renewable_energy: r.renewable_energy,
                    day_of_week: &r.day_of_week,
                    holiday_flag: &r.holiday_flag,
                    energy_consumption: r.energy_consumption,
                })
                .collect(),
        };
        let request = async {
            let response = self
                .client
                .post(&self.url)
                .json(&payload)
                .send()
                .await?
                .error_for_status()?;
            let body: PredictResponse = response.json().await?;
            Ok::<_, reqwest::Error>(body.prediction)
        };
        let prediction = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ForecastError::Timeout(self.timeout))??;
        if !prediction.is_finite() {
            return Err(ForecastError::BadResponse(format!("non-finite prediction {prediction}")));
        }
        Ok(prediction)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_reading;

    #[tokio::test]
    async fn moving_average_uses_most_recent_window() {
        let forecaster = MovingAverageForecaster::new(3);
        let history: Vec<Reading> = [90.0, 80.0, 70.0, 10.0]
            .iter()
            .map(|value| sample_reading("", *value))
            .collect();
        let prediction = forecaster.predict(&history).await.unwrap();
        assert!((prediction - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn moving_average_needs_a_full_window() {
        let forecaster = MovingAverageForecaster::default();
        let history = vec![sample_reading("", 70.0); 5];
        assert!(matches!(
            forecaster.predict(&history).await,
            Err(ForecastError::InsufficientHistory { have: 5, need: 12 })
        ));
    }

    #[tokio::test]
    async fn unreachable_model_service_errors() {
        let forecaster = HttpForecaster::new(
            "http://127.0.0.1:9/predict".to_string(),
            Duration::from_millis(300),
        );
        let history = vec![sample_reading("", 70.0); 3];
        assert!(forecaster.predict(&history).await.is_err());
    }
}
