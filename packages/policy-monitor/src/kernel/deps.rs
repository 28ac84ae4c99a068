//! Monitor dependencies (using traits for testability)
//!
//! This module provides the dependency container the service binary, the
//! CLI, and the tests wire job handlers and claim workflows from. Every
//! store and external service sits behind a trait.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;

use crate::domains::claims::{ClaimConfig, ClaimLifecycle, ClaimStore, PostgresClaimStore};
use crate::domains::monitoring::{
    FetchFarmMonitoringDataHandler, ForwardingHandler, MonitoringStore, PostgresMonitoringStore,
};
use crate::domains::policies::{CatalogPolicySource, PolicyCatalog, PostgresPolicyCatalog};
use crate::domains::triggers::EvaluatorConfig;
use crate::kernel::jobs::{JobHandlerRegistry, JobType, PostgresWorkerPersistor, WorkerPersistor};
use crate::kernel::{BaseDataProvider, BasePolicySource};

// =============================================================================
// Forwarding endpoints
// =============================================================================

/// Where AI pool jobs are handed off. `None` records the payload as accepted.
#[derive(Debug, Clone)]
pub struct ForwardingEndpoints {
    pub document_validation: Option<String>,
    pub farm_imagery: Option<String>,
    pub timeout: Duration,
}

impl Default for ForwardingEndpoints {
    fn default() -> Self {
        Self {
            document_validation: None,
            farm_imagery: None,
            timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// MonitorDeps
// =============================================================================

#[derive(Clone)]
pub struct MonitorDeps {
    pub catalog: Arc<dyn PolicyCatalog>,
    pub provider: Arc<dyn BaseDataProvider>,
    pub monitoring: Arc<dyn MonitoringStore>,
    pub claims: Arc<dyn ClaimStore>,
    pub persistor: Arc<dyn WorkerPersistor>,
    pub evaluator: EvaluatorConfig,
    pub claim_config: ClaimConfig,
    pub forwarding: ForwardingEndpoints,
}

impl MonitorDeps {
    pub fn new(
        catalog: Arc<dyn PolicyCatalog>,
        provider: Arc<dyn BaseDataProvider>,
        monitoring: Arc<dyn MonitoringStore>,
        claims: Arc<dyn ClaimStore>,
        persistor: Arc<dyn WorkerPersistor>,
    ) -> Self {
        Self {
            catalog,
            provider,
            monitoring,
            claims,
            persistor,
            evaluator: EvaluatorConfig::default(),
            claim_config: ClaimConfig::default(),
            forwarding: ForwardingEndpoints::default(),
        }
    }

    /// Postgres-backed stores on one pool.
    pub fn postgres(pool: PgPool, provider: Arc<dyn BaseDataProvider>) -> Self {
        Self::new(
            Arc::new(PostgresPolicyCatalog::new(pool.clone())),
            provider,
            Arc::new(PostgresMonitoringStore::new(pool.clone())),
            Arc::new(PostgresClaimStore::new(pool.clone())),
            Arc::new(PostgresWorkerPersistor::new(pool)),
        )
    }

    pub fn with_evaluator(mut self, evaluator: EvaluatorConfig) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_claim_config(mut self, claim_config: ClaimConfig) -> Self {
        self.claim_config = claim_config;
        self
    }

    pub fn with_forwarding(mut self, forwarding: ForwardingEndpoints) -> Self {
        self.forwarding = forwarding;
        self
    }

    pub fn policy_source(&self) -> Arc<dyn BasePolicySource> {
        Arc::new(CatalogPolicySource::new(self.catalog.clone()))
    }

    pub fn claim_lifecycle(&self) -> ClaimLifecycle {
        ClaimLifecycle::new(self.claims.clone(), self.catalog.clone())
    }

    pub fn fetch_handler(&self) -> FetchFarmMonitoringDataHandler {
        FetchFarmMonitoringDataHandler::builder()
            .catalog(self.catalog.clone())
            .provider(self.provider.clone())
            .monitoring(self.monitoring.clone())
            .claims(self.claims.clone())
            .evaluator(self.evaluator.clone())
            .claim_config(self.claim_config.clone())
            .build()
    }

    /// Registry with a handler for every [`JobType`].
    pub fn job_registry(&self) -> Result<Arc<JobHandlerRegistry>> {
        let registry = JobHandlerRegistry::new();
        registry.register(
            JobType::FetchFarmMonitoringData,
            Arc::new(self.fetch_handler()),
        );
        registry.register(
            JobType::DocumentValidation,
            Arc::new(ForwardingHandler::new(
                JobType::DocumentValidation,
                self.forwarding.document_validation.clone(),
                self.forwarding.timeout,
            )?),
        );
        registry.register(
            JobType::FarmImagery,
            Arc::new(ForwardingHandler::new(
                JobType::FarmImagery,
                self.forwarding.farm_imagery.clone(),
                self.forwarding.timeout,
            )?),
        );
        Ok(Arc::new(registry))
    }
}
