//! Handlers for the AI pool job types (`document-validation`,
//! `farm-imagery`). The analysis itself runs elsewhere; these hand the
//! payload to the configured service, or record it as accepted when no
//! service is configured.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::kernel::jobs::{JobContext, JobError, JobHandler, JobType};

pub struct ForwardingHandler {
    job_type: JobType,
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl ForwardingHandler {
    pub fn new(job_type: JobType, endpoint: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            job_type,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
            client,
        })
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn post(
        &self,
        endpoint: &str,
        ctx: &JobContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, JobError> {
        let body = json!({
            "job_id": ctx.job_id,
            "job_type": self.job_type,
            "policy_id": ctx.policy_id,
            "attempt": ctx.attempt,
            "params": params,
        });

        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                JobError::transient(anyhow::Error::new(e).context("forwarding request"))
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(JobError::transient(anyhow::anyhow!(
                "{} responded {}",
                endpoint,
                status
            )));
        }
        if !status.is_success() {
            return Err(JobError::permanent(anyhow::anyhow!(
                "{} rejected {} job: {}",
                endpoint,
                self.job_type,
                status
            )));
        }

        let text = response.text().await.unwrap_or_default();
        let response = serde_json::from_str::<serde_json::Value>(&text)
            .unwrap_or(serde_json::Value::String(text));
        Ok(json!({
            "forwarded": true,
            "status": status.as_u16(),
            "response": response,
        }))
    }
}

#[async_trait]
impl JobHandler for ForwardingHandler {
    async fn execute(
        &self,
        ctx: &JobContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, JobError> {
        if !params.is_object() {
            return Err(JobError::permanent(anyhow::anyhow!(
                "{} params must be a JSON object",
                self.job_type
            )));
        }

        match &self.endpoint {
            Some(endpoint) => {
                let summary = self.post(endpoint, ctx, params).await?;
                info!(job_id = %ctx.job_id, job_type = %self.job_type, "job forwarded");
                Ok(summary)
            }
            None => {
                debug!(
                    job_id = %ctx.job_id,
                    job_type = %self.job_type,
                    "no endpoint configured, accepting"
                );
                Ok(json!({ "accepted": true, "payload": params }))
            }
        }
    }
}
