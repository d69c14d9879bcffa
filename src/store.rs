pub mod postgres;

use crate::error::StoreError;
use crate::reading::Reading;
use async_trait::async_trait;

pub use postgres::PgReadingStore;

/// Relational store for readings. Every write is a single-row upsert keyed on
/// `correlation_id`, so a replayed reading never produces a second row.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Returns `false` when a row with the same correlation id already exists.
    async fn save(&self, reading: &Reading) -> Result<bool, StoreError>;

    async fn find_by_correlation_id(&self, correlation_id: &str)
        -> Result<Option<Reading>, StoreError>;

    async fn exists_by_correlation_id(&self, correlation_id: &str) -> Result<bool, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Newest first.
    async fn find_recent(&self, limit: usize) -> Result<Vec<Reading>, StoreError>;

    async fn delete_all(&self) -> Result<u64, StoreError>;
}
