use chrono::{Datelike, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One building telemetry sample.
///
/// `correlation_id` is the deduplication key in the store; it is assigned the
/// first time the reading is processed and never changes afterwards, so a
/// redelivered copy always maps to the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<NaiveDateTime>,
    pub temperature: f64,
    pub humidity: f64,
    pub square_footage: f64,
    pub occupancy: i32,
    pub hvac_state: String,
    pub lighting_state: String,
    pub renewable_energy: f64,
    pub day_of_week: String,
    pub holiday_flag: String,
    pub energy_consumption: f64,
}

impl Reading {
    /// Assigns a correlation id and timestamp when missing and returns the id.
    pub fn ensure_identity(&mut self) -> String {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now().naive_utc());
        }
        if self.correlation_id().is_none() {
            self.correlation_id = Some(Uuid::new_v4().to_string());
        }
        self.correlation_id.clone().unwrap_or_default()
    }

    /// Rewrites the emission time and the matching weekday name.
    pub fn stamp(&mut self, at: NaiveDateTime) {
        self.timestamp = Some(at);
        self.day_of_week = day_name(at.weekday()).to_string();
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref().filter(|id| !id.is_empty())
    }
}

pub fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
