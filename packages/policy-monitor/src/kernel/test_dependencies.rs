// TestDependencies - in-memory implementations for testing
//
// Provides stores and a scripted data provider that can be injected into
// MonitorDeps for tests that do not need Postgres.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::jobs::testing::InMemoryWorkerPersistor;
use super::{BaseDataProvider, MonitorDeps, ProviderError, SeriesPoint, SeriesRequest};
use crate::common::{BasePolicyId, ClaimId, ConditionId, DataSourceId, FarmId, PolicyId, TriggerId};
use crate::domains::claims::{
    Claim, ClaimStatus, ClaimStore, EvaluationRecord, Payout, PayoutStatus, TriggerEvaluationLog,
};
use crate::domains::monitoring::{FarmMonitoringData, MonitoringStore};
use crate::domains::policies::{BasePolicy, DataSource, PolicyCatalog, PolicyStatus, RegisteredPolicy};
use crate::domains::triggers::{ConditionStreak, Trigger, TriggerCondition};

// =============================================================================
// Mock Data Provider
// =============================================================================

/// Returns the configured series per data source, clipped to the requested
/// window. Queued errors are returned first, one per call.
#[derive(Default)]
pub struct MockDataProvider {
    series: Mutex<HashMap<DataSourceId, Vec<SeriesPoint>>>,
    errors: Mutex<Vec<ProviderError>>,
    calls: Mutex<Vec<SeriesRequest>>,
}

impl MockDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// One point per `(timestamp, value)`.
    pub fn with_series(
        self,
        data_source_id: DataSourceId,
        points: &[(DateTime<Utc>, f64)],
    ) -> Self {
        self.set_series(data_source_id, points);
        self
    }

    pub fn set_series(&self, data_source_id: DataSourceId, points: &[(DateTime<Utc>, f64)]) {
        let points = points
            .iter()
            .map(|(at, value)| SeriesPoint {
                dt: at.timestamp(),
                data: *value,
                count: 1,
                unit: None,
            })
            .collect();
        self.series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(data_source_id, points);
    }

    pub fn fail_next(&self, error: ProviderError) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(error);
    }

    pub fn calls(&self) -> Vec<SeriesRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl BaseDataProvider for MockDataProvider {
    async fn fetch_series(
        &self,
        request: &SeriesRequest,
    ) -> std::result::Result<Vec<SeriesPoint>, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        {
            let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }

        let from = request.from.timestamp();
        let to = request.to.timestamp();
        Ok(self
            .series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.data_source_id)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.dt >= from && p.dt <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// In-memory Policy Catalog
// =============================================================================

#[derive(Default)]
struct CatalogTables {
    policies: HashMap<PolicyId, RegisteredPolicy>,
    base_policies: HashMap<BasePolicyId, BasePolicy>,
    triggers: Vec<Trigger>,
    conditions: Vec<TriggerCondition>,
    data_sources: HashMap<DataSourceId, DataSource>,
}

#[derive(Default)]
pub struct InMemoryPolicyCatalog {
    tables: RwLock<CatalogTables>,
}

impl InMemoryPolicyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CatalogTables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_policy(&self, policy: RegisteredPolicy) {
        self.write().policies.insert(policy.id, policy);
    }

    pub fn add_base_policy(&self, base_policy: BasePolicy) {
        self.write().base_policies.insert(base_policy.id, base_policy);
    }

    pub fn add_trigger(&self, trigger: Trigger) {
        self.write().triggers.push(trigger);
    }

    pub fn add_condition(&self, condition: TriggerCondition) {
        self.write().conditions.push(condition);
    }

    pub fn add_data_source(&self, data_source: DataSource) {
        self.write().data_sources.insert(data_source.id, data_source);
    }

    pub fn set_status(&self, policy_id: PolicyId, status: PolicyStatus) {
        if let Some(policy) = self.write().policies.get_mut(&policy_id) {
            policy.status = status;
        }
    }
}

#[async_trait]
impl PolicyCatalog for InMemoryPolicyCatalog {
    async fn active_policy_ids(&self) -> Result<Vec<PolicyId>> {
        let tables = self.read();
        let mut active: Vec<&RegisteredPolicy> =
            tables.policies.values().filter(|p| p.is_active()).collect();
        active.sort_by_key(|p| p.created_at);
        Ok(active.into_iter().map(|p| p.id).collect())
    }

    async fn find_policy(&self, id: PolicyId) -> Result<Option<RegisteredPolicy>> {
        Ok(self.read().policies.get(&id).cloned())
    }

    async fn find_base_policy(&self, id: BasePolicyId) -> Result<Option<BasePolicy>> {
        Ok(self.read().base_policies.get(&id).cloned())
    }

    async fn find_triggers_for_base_policy(&self, id: BasePolicyId) -> Result<Vec<Trigger>> {
        Ok(self
            .read()
            .triggers
            .iter()
            .filter(|t| t.base_policy_id == id)
            .cloned()
            .collect())
    }

    async fn find_conditions(&self, trigger_id: TriggerId) -> Result<Vec<TriggerCondition>> {
        let mut conditions: Vec<TriggerCondition> = self
            .read()
            .conditions
            .iter()
            .filter(|c| c.base_policy_trigger_id == trigger_id)
            .cloned()
            .collect();
        conditions.sort_by_key(|c| c.condition_order);
        Ok(conditions)
    }

    async fn find_data_sources(&self, ids: &[DataSourceId]) -> Result<Vec<DataSource>> {
        let tables = self.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.data_sources.get(id).cloned())
            .collect())
    }

    async fn policy_status(&self, id: PolicyId) -> Result<Option<PolicyStatus>> {
        Ok(self.read().policies.get(&id).map(|p| p.status))
    }
}

// =============================================================================
// In-memory Monitoring Store
// =============================================================================

#[derive(Default)]
pub struct InMemoryMonitoringStore {
    rows: RwLock<Vec<FarmMonitoringData>>,
}

impl InMemoryMonitoringStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<FarmMonitoringData> {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl MonitoringStore for InMemoryMonitoringStore {
    async fn insert_measurements(&self, rows: &[FarmMonitoringData]) -> Result<u64> {
        let mut stored = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let mut inserted = 0;
        for row in rows {
            let duplicate = stored.iter().any(|r| {
                r.farm_id == row.farm_id
                    && r.data_source_id == row.data_source_id
                    && r.measurement_timestamp == row.measurement_timestamp
            });
            if !duplicate {
                stored.push(row.clone());
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
        let mut rows: Vec<FarmMonitoringData> = self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| {
                r.farm_id == farm_id
                    && data_source_ids.contains(&r.data_source_id)
                    && r.measurement_timestamp >= from
                    && r.measurement_timestamp <= to
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.measurement_timestamp);
        Ok(rows)
    }
}

// =============================================================================
// In-memory Claim Store
// =============================================================================

#[derive(Default)]
struct ClaimTables {
    claims: Vec<Claim>,
    logs: Vec<TriggerEvaluationLog>,
    payouts: Vec<Payout>,
    streaks: HashMap<(PolicyId, ConditionId), ConditionStreak>,
}

impl ClaimTables {
    fn open_claim(
        &self,
        policy_id: PolicyId,
        trigger_id: TriggerId,
        since: DateTime<Utc>,
    ) -> Option<Claim> {
        self.claims
            .iter()
            .filter(|c| {
                c.registered_policy_id == policy_id
                    && c.base_policy_trigger_id == trigger_id
                    && c.status.is_open()
                    && c.trigger_timestamp > since
            })
            .max_by_key(|c| c.trigger_timestamp)
            .cloned()
    }
}

/// Claim tables under one lock, so every multi-row write is atomic.
#[derive(Default)]
pub struct InMemoryClaimStore {
    tables: RwLock<ClaimTables>,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ClaimTables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ClaimTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_claim(&self, claim: Claim) {
        self.write().claims.push(claim);
    }

    pub fn claims(&self) -> Vec<Claim> {
        self.read().claims.clone()
    }

    pub fn logs(&self) -> Vec<TriggerEvaluationLog> {
        self.read().logs.clone()
    }

    pub fn payouts(&self) -> Vec<Payout> {
        self.read().payouts.clone()
    }

    pub fn streak(&self, policy_id: PolicyId, condition_id: ConditionId) -> Option<ConditionStreak> {
        self.read().streaks.get(&(policy_id, condition_id)).cloned()
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn find_claim(&self, id: ClaimId) -> Result<Option<Claim>> {
        Ok(self.read().claims.iter().find(|c| c.id == id).cloned())
    }

    async fn find_open_claim(
        &self,
        policy_id: PolicyId,
        trigger_id: TriggerId,
        since: DateTime<Utc>,
    ) -> Result<Option<Claim>> {
        Ok(self.read().open_claim(policy_id, trigger_id, since))
    }

    async fn record_evaluation(&self, record: &EvaluationRecord) -> Result<Option<Claim>> {
        let mut tables = self.write();
        let mut log = record.log.clone();
        let mut open = None;
        if let Some((claim, open_since)) = &record.candidate {
            open = tables.open_claim(
                claim.registered_policy_id,
                claim.base_policy_trigger_id,
                *open_since,
            );
            match &open {
                Some(existing) => log.mark_suppressed(existing.id),
                None => {
                    if tables.claims.iter().any(|c| c.claim_number == claim.claim_number) {
                        anyhow::bail!("duplicate claim number {}", claim.claim_number);
                    }
                    tables.claims.push(claim.clone());
                    log.link_claim(claim.id);
                }
            }
        }
        for streak in &record.streaks {
            tables.streaks.insert(
                (streak.registered_policy_id, streak.condition_id),
                streak.clone(),
            );
        }
        tables.logs.push(log);
        Ok(open)
    }

    async fn streaks(&self, policy_id: PolicyId) -> Result<Vec<ConditionStreak>> {
        Ok(self
            .read()
            .streaks
            .values()
            .filter(|s| s.registered_policy_id == policy_id)
            .cloned()
            .collect())
    }

    async fn evaluation_logs(
        &self,
        policy_id: PolicyId,
        limit: i64,
    ) -> Result<Vec<TriggerEvaluationLog>> {
        let mut logs: Vec<TriggerEvaluationLog> = self
            .read()
            .logs
            .iter()
            .filter(|l| l.registered_policy_id == policy_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.evaluation_timestamp.cmp(&a.evaluation_timestamp));
        logs.truncate(limit.max(0) as usize);
        Ok(logs)
    }

    async fn transition_claim(
        &self,
        claim: &Claim,
        expected: ClaimStatus,
        payout: Option<&Payout>,
    ) -> Result<bool> {
        let mut tables = self.write();
        if let Some(payout) = payout {
            if tables.payouts.iter().any(|p| p.claim_id == payout.claim_id) {
                anyhow::bail!("claim {} already has a payout", payout.claim_id);
            }
        }
        let Some(stored) = tables
            .claims
            .iter_mut()
            .find(|c| c.id == claim.id && c.status == expected)
        else {
            return Ok(false);
        };
        *stored = claim.clone();
        if let Some(payout) = payout {
            tables.payouts.push(payout.clone());
        }
        Ok(true)
    }

    async fn mark_claim_paid(&self, claim: &Claim, at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.write();
        let Some(stored) = tables
            .claims
            .iter_mut()
            .find(|c| c.id == claim.id && c.status == ClaimStatus::Approved)
        else {
            return Ok(false);
        };
        *stored = claim.clone();
        for payout in tables.payouts.iter_mut().filter(|p| p.claim_id == claim.id) {
            if payout.status != PayoutStatus::Completed {
                payout.status = PayoutStatus::Completed;
                payout.completed_at = Some(at);
            }
        }
        Ok(true)
    }

    async fn auto_approvable_claims(&self, now: DateTime<Utc>) -> Result<Vec<Claim>> {
        let mut due: Vec<Claim> = self
            .read()
            .claims
            .iter()
            .filter(|c| c.is_auto_approvable(now))
            .cloned()
            .collect();
        due.sort_by_key(|c| c.auto_approval_deadline);
        Ok(due)
    }

    async fn find_payout(&self, claim_id: ClaimId) -> Result<Option<Payout>> {
        Ok(self
            .read()
            .payouts
            .iter()
            .find(|p| p.claim_id == claim_id)
            .cloned())
    }
}

// =============================================================================
// TestDependencies
// =============================================================================

/// In-memory doubles for every seam of [`MonitorDeps`], kept as concrete
/// types so tests can seed and inspect them.
pub struct TestDependencies {
    pub catalog: Arc<InMemoryPolicyCatalog>,
    pub provider: Arc<MockDataProvider>,
    pub monitoring: Arc<InMemoryMonitoringStore>,
    pub claims: Arc<InMemoryClaimStore>,
    pub persistor: Arc<InMemoryWorkerPersistor>,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            catalog: Arc::new(InMemoryPolicyCatalog::new()),
            provider: Arc::new(MockDataProvider::new()),
            monitoring: Arc::new(InMemoryMonitoringStore::new()),
            claims: Arc::new(InMemoryClaimStore::new()),
            persistor: Arc::new(InMemoryWorkerPersistor::new()),
        }
    }

    pub fn deps(&self) -> MonitorDeps {
        MonitorDeps::new(
            self.catalog.clone(),
            self.provider.clone(),
            self.monitoring.clone(),
            self.claims.clone(),
            self.persistor.clone(),
        )
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
