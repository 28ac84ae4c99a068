//! Read access to the policy catalog.
//!
//! [`PolicyCatalog`] is the repository seam the monitor reads policies,
//! products, triggers, and data sources through. [`MonitoringPlan`] composes
//! them into what one policy's scheduler and fetch handler need.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use super::models::{BasePolicy, DataSource, PolicyStatus, RegisteredPolicy};
use crate::common::{
    BasePolicyId, DataSourceId, FrequencyUnit, MonitorCadence, PolicyId, TriggerId,
};
use crate::domains::triggers::{Trigger, TriggerCondition};
use crate::kernel::jobs::{MonitorTarget, MonitoredParameter};
use crate::kernel::BasePolicySource;

// =============================================================================
// Catalog trait
// =============================================================================

#[async_trait]
pub trait PolicyCatalog: Send + Sync {
    async fn active_policy_ids(&self) -> Result<Vec<PolicyId>>;

    async fn find_policy(&self, id: PolicyId) -> Result<Option<RegisteredPolicy>>;

    async fn find_base_policy(&self, id: BasePolicyId) -> Result<Option<BasePolicy>>;

    async fn find_triggers_for_base_policy(&self, id: BasePolicyId) -> Result<Vec<Trigger>>;

    /// Ordered by `condition_order`.
    async fn find_conditions(&self, trigger_id: TriggerId) -> Result<Vec<TriggerCondition>>;

    async fn find_data_sources(&self, ids: &[DataSourceId]) -> Result<Vec<DataSource>>;

    async fn policy_status(&self, id: PolicyId) -> Result<Option<PolicyStatus>>;

    /// Load and validate everything needed to monitor one policy. Invalid
    /// conditions fail the whole load.
    async fn load_monitoring_plan(&self, id: PolicyId) -> Result<MonitoringPlan> {
        let policy = self
            .find_policy(id)
            .await?
            .with_context(|| format!("registered policy {} not found", id))?;
        let base_policy = self
            .find_base_policy(policy.base_policy_id)
            .await?
            .with_context(|| format!("base policy {} not found", policy.base_policy_id))?;

        let mut triggers = Vec::new();
        for trigger in self.find_triggers_for_base_policy(base_policy.id).await? {
            let conditions = self.find_conditions(trigger.id).await?;
            for condition in &conditions {
                condition.validate()?;
            }
            triggers.push(TriggerPlan {
                trigger,
                conditions,
            });
        }

        let mut ids: Vec<DataSourceId> = triggers
            .iter()
            .flat_map(|t| t.conditions.iter().map(|c| c.data_source_id))
            .collect();
        ids.sort();
        ids.dedup();
        let data_sources = self
            .find_data_sources(&ids)
            .await?
            .into_iter()
            .map(|ds| (ds.id, ds))
            .collect::<HashMap<_, _>>();
        if let Some(missing) = ids.iter().find(|id| !data_sources.contains_key(id)) {
            anyhow::bail!("data source {} referenced by a condition does not exist", missing);
        }

        Ok(MonitoringPlan {
            policy,
            base_policy,
            triggers,
            data_sources,
        })
    }
}

// =============================================================================
// Monitoring plan
// =============================================================================

#[derive(Debug, Clone)]
pub struct TriggerPlan {
    pub trigger: Trigger,
    pub conditions: Vec<TriggerCondition>,
}

#[derive(Debug, Clone)]
pub struct MonitoringPlan {
    pub policy: RegisteredPolicy,
    pub base_policy: BasePolicy,
    pub triggers: Vec<TriggerPlan>,
    pub data_sources: HashMap<DataSourceId, DataSource>,
}

impl MonitoringPlan {
    /// The most frequent trigger cadence; one day when there are no triggers.
    pub fn cadence(&self) -> MonitorCadence {
        self.triggers
            .iter()
            .map(|t| t.trigger.cadence())
            .min_by_key(|c| c.to_duration())
            .unwrap_or_else(|| MonitorCadence::new(1, FrequencyUnit::Day))
    }

    /// Longest history any condition reads, in days. At least one.
    pub fn lookback_days(&self) -> i32 {
        self.triggers
            .iter()
            .flat_map(|t| t.conditions.iter().map(TriggerCondition::lookback_days))
            .max()
            .unwrap_or(1)
            .max(1)
    }

    pub fn parameters(&self) -> Vec<MonitoredParameter> {
        let mut parameters: Vec<MonitoredParameter> = self
            .data_sources
            .values()
            .map(|ds| MonitoredParameter {
                data_source_id: ds.id,
                parameter_name: ds.parameter_name.clone(),
            })
            .collect();
        parameters.sort_by_key(|p| p.data_source_id);
        parameters
    }

    pub fn monitor_target(&self) -> MonitorTarget {
        MonitorTarget::builder()
            .policy_id(self.policy.id)
            .base_policy_id(self.policy.base_policy_id)
            .farm_id(self.policy.farm_id)
            .cadence(self.cadence())
            .parameters(self.parameters())
            .lookback_days(self.lookback_days())
            .build()
    }
}

// =============================================================================
// Postgres catalog
// =============================================================================

pub struct PostgresPolicyCatalog {
    pool: PgPool,
}

impl PostgresPolicyCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyCatalog for PostgresPolicyCatalog {
    async fn active_policy_ids(&self) -> Result<Vec<PolicyId>> {
        RegisteredPolicy::find_active_ids(&self.pool).await
    }

    async fn find_policy(&self, id: PolicyId) -> Result<Option<RegisteredPolicy>> {
        RegisteredPolicy::find_by_id(id, &self.pool).await
    }

    async fn find_base_policy(&self, id: BasePolicyId) -> Result<Option<BasePolicy>> {
        BasePolicy::find_by_id(id, &self.pool).await
    }

    async fn find_triggers_for_base_policy(&self, id: BasePolicyId) -> Result<Vec<Trigger>> {
        Trigger::find_for_base_policy(id, &self.pool).await
    }

    async fn find_conditions(&self, trigger_id: TriggerId) -> Result<Vec<TriggerCondition>> {
        TriggerCondition::find_for_trigger(trigger_id, &self.pool).await
    }

    async fn find_data_sources(&self, ids: &[DataSourceId]) -> Result<Vec<DataSource>> {
        DataSource::find_by_ids(ids, &self.pool).await
    }

    async fn policy_status(&self, id: PolicyId) -> Result<Option<PolicyStatus>> {
        RegisteredPolicy::find_status(id, &self.pool).await
    }
}

// =============================================================================
// Policy source adapter (what the worker kernel consumes)
// =============================================================================

/// Exposes a [`PolicyCatalog`] as the kernel's [`BasePolicySource`].
pub struct CatalogPolicySource {
    catalog: Arc<dyn PolicyCatalog>,
}

impl CatalogPolicySource {
    pub fn new(catalog: Arc<dyn PolicyCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl BasePolicySource for CatalogPolicySource {
    async fn active_policy_ids(&self) -> Result<Vec<PolicyId>> {
        self.catalog.active_policy_ids().await
    }

    async fn is_policy_active(&self, policy_id: PolicyId) -> Result<bool> {
        Ok(self.catalog.policy_status(policy_id).await? == Some(PolicyStatus::Active))
    }

    async fn monitor_target(&self, policy_id: PolicyId) -> Result<MonitorTarget> {
        Ok(self
            .catalog
            .load_monitoring_plan(policy_id)
            .await?
            .monitor_target())
    }
}
