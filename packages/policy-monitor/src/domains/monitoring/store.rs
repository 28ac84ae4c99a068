use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::FarmMonitoringData;
use crate::common::{DataSourceId, FarmId};

/// Fetched measurements.
#[async_trait]
pub trait MonitoringStore: Send + Sync {
    /// Insert measurements, skipping duplicates. Returns how many were new.
    async fn insert_measurements(&self, rows: &[FarmMonitoringData]) -> Result<u64>;

    /// Measurements in `[from, to]`, oldest first.
    async fn measurements(
        &self,
        farm_id: FarmId,
        data_source_ids: &[DataSourceId],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FarmMonitoringData>>;
}

pub struct PostgresMonitoringStore {
    pool: PgPool,
}

impl PostgresMonitoringStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MonitoringStore for PostgresMonitoringStore {
    async fn insert_measurements(&self, rows: &[FarmMonitoringData]) -> Result<u64> {
        let mut inserted = 0;
        for row in rows {
            if row.insert(&self.pool).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn measurements(
        &self,
        farm_id: FarmId,
        data_source_ids: &[DataSourceId],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FarmMonitoringData>> {
        FarmMonitoringData::find_in_window(farm_id, data_source_ids, from, to, &self.pool).await
    }
}
