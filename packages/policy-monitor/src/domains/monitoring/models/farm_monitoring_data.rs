use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::closed_enum;
use crate::common::{DataSourceId, FarmId, MonitoringRecordId};
use crate::domains::triggers::Measurement;
use crate::kernel::SeriesPoint;

closed_enum! {
    pub enum DataQuality as "data quality" {
        Good => "good",
        Acceptable => "acceptable",
        Poor => "poor",
    }
}

/// One measurement of one parameter for one farm. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FarmMonitoringData {
    pub id: MonitoringRecordId,
    pub farm_id: FarmId,
    pub data_source_id: DataSourceId,
    pub parameter_name: String,
    pub measured_value: f64,
    pub unit: Option<String>,
    pub measurement_timestamp: DateTime<Utc>,
    pub data_quality: DataQuality,
    pub confidence_score: Option<f64>,
    pub measurement_source: Option<String>,
    pub cloud_cover_percentage: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl FarmMonitoringData {
    /// Build a row from a provider point. Points with an unrepresentable
    /// timestamp yield `None`.
    pub fn from_point(
        farm_id: FarmId,
        data_source_id: DataSourceId,
        parameter_name: &str,
        point: &SeriesPoint,
        source: &str,
    ) -> Option<Self> {
        Some(Self {
            id: MonitoringRecordId::new(),
            farm_id,
            data_source_id,
            parameter_name: parameter_name.to_string(),
            measured_value: point.data,
            unit: point.unit.clone(),
            measurement_timestamp: point.timestamp()?,
            data_quality: DataQuality::Good,
            confidence_score: None,
            measurement_source: Some(source.to_string()),
            cloud_cover_percentage: None,
            created_at: Utc::now(),
        })
    }

    pub fn measurement(&self) -> Measurement {
        Measurement {
            timestamp: self.measurement_timestamp,
            value: self.measured_value,
        }
    }

    /// Insert one row. Returns false when a row for the same farm, data
    /// source, and timestamp already exists.
    pub async fn insert(&self, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO farm_monitoring_data (
                id, farm_id, data_source_id, parameter_name, measured_value, unit,
                measurement_timestamp, data_quality, confidence_score, measurement_source,
                cloud_cover_percentage, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (farm_id, data_source_id, measurement_timestamp) DO NOTHING
            "#,
        )
        .bind(self.id)
        .bind(self.farm_id)
        .bind(self.data_source_id)
        .bind(&self.parameter_name)
        .bind(self.measured_value)
        .bind(&self.unit)
        .bind(self.measurement_timestamp)
        .bind(self.data_quality)
        .bind(self.confidence_score)
        .bind(&self.measurement_source)
        .bind(self.cloud_cover_percentage)
        .bind(self.created_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Measurements in `[from, to]`, oldest first.
    pub async fn find_in_window(
        farm_id: FarmId,
        data_source_ids: &[DataSourceId],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM farm_monitoring_data
            WHERE farm_id = $1
              AND data_source_id = ANY($2)
              AND measurement_timestamp BETWEEN $3 AND $4
            ORDER BY measurement_timestamp ASC
            "#,
        )
        .bind(farm_id)
        .bind(data_source_ids)
        .bind(from)
        .bind(to)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_point() {
        let point = SeriesPoint {
            dt: 1_767_225_600,
            data: 12.5,
            count: 24,
            unit: Some("mm".into()),
        };
        let row = FarmMonitoringData::from_point(
            FarmId::new(),
            DataSourceId::new(),
            "rainfall",
            &point,
            "weather",
        )
        .unwrap();
        assert_eq!(row.measured_value, 12.5);
        assert_eq!(row.measurement_timestamp.timestamp(), 1_767_225_600);
        assert_eq!(row.unit.as_deref(), Some("mm"));
        assert_eq!(row.data_quality, DataQuality::Good);
        assert_eq!(row.measurement().value, 12.5);
    }

    #[test]
    fn test_out_of_range_timestamp_is_dropped() {
        let point = SeriesPoint {
            dt: i64::MAX,
            data: 1.0,
            count: 0,
            unit: None,
        };
        assert!(FarmMonitoringData::from_point(
            FarmId::new(),
            DataSourceId::new(),
            "rainfall",
            &point,
            "weather"
        )
        .is_none());
    }
}
