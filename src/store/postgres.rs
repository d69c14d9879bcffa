use super::ReadingStore;
use crate::error::StoreError;
use crate::reading::Reading;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::time::Duration;

const READING_COLUMNS: &str = "correlation_id, recorded_at, temperature, humidity, square_footage, \
     occupancy, hvac_state, lighting_state, renewable_energy, day_of_week, holiday_flag, \
     energy_consumption";

pub async fn build_pool(database_url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect_lazy(database_url)?;
    Ok(pool)
}

#[derive(Clone, Debug)]
pub struct PgReadingStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgReadingStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.bounded(
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS energy_readings (
                    id bigserial primary key,
                    correlation_id text not null unique,
                    recorded_at timestamp not null,
                    temperature double precision not null,
                    humidity double precision not null,
                    square_footage double precision not null,
                    occupancy integer not null,
                    hvac_state text not null,
                    lighting_state text not null,
                    renewable_energy double precision not null,
                    day_of_week text not null,
                    holiday_flag text not null,
                    energy_consumption double precision not null,
                    inserted_at timestamptz not null default now()
                )
                "#,
            )
            .execute(&self.pool),
        )
        .await?;
        self.bounded(
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS energy_readings_recorded_at_idx ON energy_readings (recorded_at DESC)",
            )
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn bounded<T, F>(&self, query: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

fn reading_from_row(row: &PgRow) -> Result<Reading, sqlx::Error> {
    Ok(Reading {
        correlation_id: Some(row.try_get("correlation_id")?),
        timestamp: Some(row.try_get("recorded_at")?),
        temperature: row.try_get("temperature")?,
        humidity: row.try_get("humidity")?,
        square_footage: row.try_get("square_footage")?,
        occupancy: row.try_get("occupancy")?,
        hvac_state: row.try_get("hvac_state")?,
        lighting_state: row.try_get("lighting_state")?,
        renewable_energy: row.try_get("renewable_energy")?,
        day_of_week: row.try_get("day_of_week")?,
        holiday_flag: row.try_get("holiday_flag")?,
        energy_consumption: row.try_get("energy_consumption")?,
    })
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn save(&self, reading: &Reading) -> Result<bool, StoreError> {
        let Some(correlation_id) = reading.correlation_id() else {
            return Err(StoreError::Generic("reading has no correlation id".to_string()));
        };
        let Some(recorded_at) = reading.timestamp else {
            return Err(StoreError::Generic("reading has no timestamp".to_string()));
        };
        let sql = format!(
            "INSERT INTO energy_readings ({READING_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (correlation_id) DO NOTHING"
        );
        let result = self
            .bounded(
                sqlx::query(&sql)
                    .bind(correlation_id)
                    .bind(recorded_at)
                    .bind(reading.temperature)
                    .bind(reading.humidity)
                    .bind(reading.square_footage)
                    .bind(reading.occupancy)
                    .bind(&reading.hvac_state)
                    .bind(&reading.lighting_state)
                    .bind(reading.renewable_energy)
                    .bind(&reading.day_of_week)
                    .bind(&reading.holiday_flag)
                    .bind(reading.energy_consumption)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Reading>, StoreError> {
        let sql = format!("SELECT {READING_COLUMNS} FROM energy_readings WHERE correlation_id = $1");
        let row = self
            .bounded(sqlx::query(&sql).bind(correlation_id).fetch_optional(&self.pool))
            .await?;
        row.as_ref()
            .map(reading_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn exists_by_correlation_id(&self, correlation_id: &str) -> Result<bool, StoreError> {
        let row = self
            .bounded(
                sqlx::query(
                    "SELECT EXISTS (SELECT 1 FROM energy_readings WHERE correlation_id = $1) AS present",
                )
                .bind(correlation_id)
                .fetch_one(&self.pool),
            )
            .await?;
        row.try_get::<bool, _>("present").map_err(StoreError::from)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = self
            .bounded(sqlx::query("SELECT COUNT(*) AS total FROM energy_readings").fetch_one(&self.pool))
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM energy_readings ORDER BY recorded_at DESC, id DESC LIMIT $1"
        );
        let rows = self
            .bounded(sqlx::query(&sql).bind(limit as i64).fetch_all(&self.pool))
            .await?;
        rows.iter()
            .map(reading_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = self
            .bounded(sqlx::query("DELETE FROM energy_readings").execute(&self.pool))
            .await?;
        Ok(result.rows_affected())
    }
}
