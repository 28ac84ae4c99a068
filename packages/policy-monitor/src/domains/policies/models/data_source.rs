use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::closed_enum;
use crate::common::DataSourceId;

closed_enum! {
    pub enum DataSourceKind as "data source type" {
        Weather => "weather",
        Satellite => "satellite",
        Derived => "derived",
    }
}

/// One measurable parameter and where the provider serves it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DataSource {
    pub id: DataSourceId,
    #[sqlx(rename = "data_source")]
    pub kind: DataSourceKind,
    pub parameter_name: String,
    pub unit: Option<String>,
    pub api_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DataSource {
    pub async fn find_by_ids(ids: &[DataSourceId], pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM data_sources WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }
}
