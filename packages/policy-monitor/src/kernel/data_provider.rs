use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{BaseDataProvider, ProviderError, SeriesPoint, SeriesRequest};

/// Weather / satellite time-series client.
///
/// `GET {base_url}/{endpoint}?farm_id=..&parameter=..&start=..&end=..`, where
/// `endpoint` is the data source's `api_endpoint` (falling back to the
/// parameter name) and `start`/`end` are unix seconds.
pub struct HttpDataProvider {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    #[serde(default)]
    data: Vec<SeriesPoint>,
}

impl HttpDataProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.into(),
            api_key,
            client,
        })
    }

    fn url_for(&self, request: &SeriesRequest) -> String {
        let path = request
            .endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(&request.parameter_name);
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// 5xx and rate limiting are worth retrying; any other 4xx is not.
fn classify_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
    let message = format!("{} {}", status, body.chars().take(200).collect::<String>());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

#[async_trait]
impl BaseDataProvider for HttpDataProvider {
    async fn fetch_series(
        &self,
        request: &SeriesRequest,
    ) -> std::result::Result<Vec<SeriesPoint>, ProviderError> {
        let mut query = vec![
            ("farm_id", request.farm_id.to_string()),
            ("parameter", request.parameter_name.clone()),
            ("start", request.from.timestamp().to_string()),
            ("end", request.to.timestamp().to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("appid", key.clone()));
        }

        let response = self
            .client
            .get(self.url_for(request))
            .query(&query)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: SeriesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid series response: {e}")))?;

        tracing::debug!(
            farm_id = %request.farm_id,
            parameter = %request.parameter_name,
            points = parsed.data.len(),
            "fetched provider series"
        );
        Ok(parsed.data)
    }
}
