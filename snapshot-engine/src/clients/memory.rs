//! In-memory store backed by `DashMap`.
//!
//! Used by the service when no external document store is configured and by
//! the test-suite. Entities are keyed by `(organization, id)`; snapshots and
//! queries by their uuid.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::store::{AnalysisStore, SnapshotUpdate, StoreError};
use crate::contracts::{
    Dashboard, DatasourceConfig, EntityRef, Experiment, FactTable, Feature, MetricDefinition, MetricGroup,
    OrganizationSettings, QueryRecord, QueryStatus, SafeRollout, Snapshot,
};

type Key = (String, String);

fn key(organization: &str, id: &str) -> Key {
    (organization.to_string(), id.to_string())
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    experiments: DashMap<Key, Experiment>,
    safe_rollouts: DashMap<Key, SafeRollout>,
    dashboards: DashMap<Key, Dashboard>,
    settings: DashMap<String, OrganizationSettings>,
    datasources: DashMap<Key, DatasourceConfig>,
    metrics: DashMap<Key, MetricDefinition>,
    metric_groups: DashMap<Key, MetricGroup>,
    fact_tables: DashMap<Key, FactTable>,
    features: DashMap<Key, Feature>,
    snapshots: DashMap<Uuid, Snapshot>,
    queries: DashMap<Uuid, QueryRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_experiment(&self, experiment: Experiment) {
        self.experiments
            .insert(key(&experiment.organization, &experiment.id), experiment);
    }

    pub fn insert_safe_rollout(&self, rollout: SafeRollout) {
        self.safe_rollouts.insert(key(&rollout.organization, &rollout.id), rollout);
    }

    pub fn insert_dashboard(&self, dashboard: Dashboard) {
        self.dashboards.insert(key(&dashboard.organization, &dashboard.id), dashboard);
    }

    pub fn insert_organization_settings(&self, settings: OrganizationSettings) {
        self.settings.insert(settings.organization.clone(), settings);
    }

    pub fn insert_datasource(&self, datasource: DatasourceConfig) {
        self.datasources
            .insert(key(&datasource.organization, &datasource.id), datasource);
    }

    pub fn insert_metric(&self, metric: MetricDefinition) {
        self.metrics.insert(key(&metric.organization, &metric.id), metric);
    }

    pub fn insert_metric_group(&self, group: MetricGroup) {
        self.metric_groups.insert(key(&group.organization, &group.id), group);
    }

    pub fn insert_fact_table(&self, fact_table: FactTable) {
        self.fact_tables
            .insert(key(&fact_table.organization, &fact_table.id), fact_table);
    }

    pub fn insert_feature(&self, feature: Feature) {
        self.features.insert(key(&feature.organization, &feature.id), feature);
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn snapshots_for(&self, entity: &EntityRef) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self
            .snapshots
            .iter()
            .filter(|s| &s.entity == entity)
            .map(|s| s.value().clone())
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    pub fn queries_for(&self, snapshot_id: Uuid) -> Vec<QueryRecord> {
        let mut queries: Vec<QueryRecord> = self
            .queries
            .iter()
            .filter(|q| q.snapshot_id == snapshot_id)
            .map(|q| q.value().clone())
            .collect();
        queries.sort_by(|a, b| a.name.cmp(&b.name));
        queries
    }

    fn replace<T>(map: &DashMap<Key, T>, entity: &'static str, k: Key, value: T) -> Result<(), StoreError> {
        match map.get_mut(&k) {
            Some(mut existing) => {
                *existing = value;
                Ok(())
            }
            None => Err(StoreError::not_found(entity, format!("{}/{}", k.0, k.1))),
        }
    }

    fn by_organization<T: Clone>(map: &DashMap<Key, T>, organization: &str) -> Vec<T> {
        let mut items: Vec<(String, T)> = map
            .iter()
            .filter(|entry| entry.key().0 == organization)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items.into_iter().map(|(_, v)| v).collect()
    }
}

#[async_trait]
impl AnalysisStore for InMemoryStore {
    async fn get_experiment(&self, organization: &str, id: &str) -> Result<Option<Experiment>, StoreError> {
        Ok(self.experiments.get(&key(organization, id)).map(|e| e.clone()))
    }

    async fn update_experiment(&self, experiment: Experiment) -> Result<(), StoreError> {
        let k = key(&experiment.organization, &experiment.id);
        Self::replace(&self.experiments, "experiment", k, experiment)
    }

    async fn find_due_experiments(&self, now: DateTime<Utc>) -> Result<Vec<Experiment>, StoreError> {
        Ok(self
            .experiments
            .iter()
            .filter(|e| e.is_due(now))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn get_safe_rollout(&self, organization: &str, id: &str) -> Result<Option<SafeRollout>, StoreError> {
        Ok(self.safe_rollouts.get(&key(organization, id)).map(|r| r.clone()))
    }

    async fn update_safe_rollout(&self, rollout: SafeRollout) -> Result<(), StoreError> {
        let k = key(&rollout.organization, &rollout.id);
        Self::replace(&self.safe_rollouts, "safe_rollout", k, rollout)
    }

    async fn find_due_safe_rollouts(&self, now: DateTime<Utc>) -> Result<Vec<SafeRollout>, StoreError> {
        Ok(self
            .safe_rollouts
            .iter()
            .filter(|r| r.is_due(now))
            .map(|r| r.value().clone())
            .collect())
    }

    async fn get_dashboard(&self, organization: &str, id: &str) -> Result<Option<Dashboard>, StoreError> {
        Ok(self.dashboards.get(&key(organization, id)).map(|d| d.clone()))
    }

    async fn update_dashboard(&self, dashboard: Dashboard) -> Result<(), StoreError> {
        let k = key(&dashboard.organization, &dashboard.id);
        Self::replace(&self.dashboards, "dashboard", k, dashboard)
    }

    async fn find_due_dashboards(&self, now: DateTime<Utc>) -> Result<Vec<Dashboard>, StoreError> {
        Ok(self
            .dashboards
            .iter()
            .filter(|d| d.is_due(now))
            .map(|d| d.value().clone())
            .collect())
    }

    async fn list_organizations(&self) -> Result<Vec<String>, StoreError> {
        let mut organizations: BTreeSet<String> = self.settings.iter().map(|s| s.key().clone()).collect();
        organizations.extend(self.experiments.iter().map(|e| e.key().0.clone()));
        organizations.extend(self.safe_rollouts.iter().map(|e| e.key().0.clone()));
        organizations.extend(self.datasources.iter().map(|e| e.key().0.clone()));
        organizations.extend(self.fact_tables.iter().map(|e| e.key().0.clone()));
        organizations.extend(self.features.iter().map(|e| e.key().0.clone()));
        Ok(organizations.into_iter().collect())
    }

    async fn get_organization_settings(&self, organization: &str) -> Result<OrganizationSettings, StoreError> {
        Ok(self
            .settings
            .get(organization)
            .map(|s| s.clone())
            .unwrap_or_else(|| OrganizationSettings::new(organization)))
    }

    async fn get_datasource(&self, organization: &str, id: &str) -> Result<Option<DatasourceConfig>, StoreError> {
        Ok(self.datasources.get(&key(organization, id)).map(|d| d.clone()))
    }

    async fn list_datasources(&self, organization: &str) -> Result<Vec<DatasourceConfig>, StoreError> {
        Ok(Self::by_organization(&self.datasources, organization))
    }

    async fn update_datasource(&self, datasource: DatasourceConfig) -> Result<(), StoreError> {
        let k = key(&datasource.organization, &datasource.id);
        Self::replace(&self.datasources, "datasource", k, datasource)
    }

    async fn get_metric(&self, organization: &str, id: &str) -> Result<Option<MetricDefinition>, StoreError> {
        Ok(self.metrics.get(&key(organization, id)).map(|m| m.clone()))
    }

    async fn get_metric_group(&self, organization: &str, id: &str) -> Result<Option<MetricGroup>, StoreError> {
        Ok(self.metric_groups.get(&key(organization, id)).map(|g| g.clone()))
    }

    async fn list_fact_tables(&self, organization: &str) -> Result<Vec<FactTable>, StoreError> {
        Ok(Self::by_organization(&self.fact_tables, organization))
    }

    async fn update_fact_table(&self, fact_table: FactTable) -> Result<(), StoreError> {
        let k = key(&fact_table.organization, &fact_table.id);
        Self::replace(&self.fact_tables, "fact_table", k, fact_table)
    }

    async fn list_features(&self, organization: &str) -> Result<Vec<Feature>, StoreError> {
        Ok(Self::by_organization(&self.features, organization))
    }

    async fn update_feature(&self, feature: Feature) -> Result<(), StoreError> {
        let k = key(&feature.organization, &feature.id);
        Self::replace(&self.features, "feature", k, feature)
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        match self.snapshots.entry(snapshot.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::Conflict(format!("snapshot {} already exists", snapshot.id)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(snapshot);
                Ok(())
            }
        }
    }

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshots.get(&id).map(|s| s.clone()))
    }

    async fn update_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        match self.snapshots.get_mut(&snapshot.id) {
            Some(mut existing) => {
                *existing = snapshot;
                Ok(())
            }
            None => Err(StoreError::not_found("snapshot", snapshot.id.to_string())),
        }
    }

    async fn update_running_snapshot(
        &self,
        id: Uuid,
        change: &(dyn for<'s> Fn(&'s Snapshot) -> Snapshot + Send + Sync),
    ) -> Result<SnapshotUpdate, StoreError> {
        // The shard lock is held from the status check through the write.
        match self.snapshots.get_mut(&id) {
            Some(mut existing) => {
                if existing.status.is_terminal() {
                    return Ok(SnapshotUpdate::AlreadyFinal(existing.clone()));
                }
                let changed = change(&*existing);
                *existing = changed.clone();
                Ok(SnapshotUpdate::Applied(changed))
            }
            None => Err(StoreError::not_found("snapshot", id.to_string())),
        }
    }

    async fn find_latest_snapshot(
        &self,
        entity: &EntityRef,
        phase: Option<usize>,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .snapshots
            .iter()
            .filter(|s| &s.entity == entity && s.dimension.is_none())
            .filter(|s| phase.map_or(true, |p| s.phase == p))
            .max_by_key(|s| s.created_at)
            .map(|s| s.value().clone()))
    }

    async fn create_query(&self, query: QueryRecord) -> Result<(), StoreError> {
        match self.queries.entry(query.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::Conflict(format!("query {} already exists", query.id)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(query);
                Ok(())
            }
        }
    }

    async fn get_query(&self, id: Uuid) -> Result<Option<QueryRecord>, StoreError> {
        Ok(self.queries.get(&id).map(|q| q.clone()))
    }

    async fn update_query(&self, query: QueryRecord) -> Result<(), StoreError> {
        match self.queries.get_mut(&query.id) {
            Some(mut existing) => {
                *existing = query;
                Ok(())
            }
            None => Err(StoreError::not_found("query", query.id.to_string())),
        }
    }

    async fn find_cached_query(
        &self,
        organization: &str,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<QueryRecord>, StoreError> {
        Ok(self
            .queries
            .iter()
            .filter(|q| q.organization == organization && q.fingerprint == fingerprint)
            .filter(|q| q.status == QueryStatus::Succeeded && q.started_at >= since)
            .max_by_key(|q| q.started_at)
            .map(|q| q.value().clone()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{CreateSnapshotRequest, SnapshotOutcome, SnapshotStatus, SnapshotTrigger, StatsEngineKind};
    use chrono::Duration;

    fn snapshot(entity: &EntityRef, phase: usize, dimension: Option<&str>) -> Snapshot {
        Snapshot::start(
            &CreateSnapshotRequest {
                entity: entity.clone(),
                phase,
                dimension: dimension.map(str::to_string),
                use_cache: false,
                trigger: SnapshotTrigger::Manual,
            },
            StatsEngineKind::Bayesian,
        )
    }

    #[tokio::test]
    async fn test_latest_snapshot_ignores_dimension_snapshots() {
        let store = InMemoryStore::new();
        let entity = EntityRef::experiment("exp_1", "org_1");

        let mut older = snapshot(&entity, 0, None);
        older.created_at = Utc::now() - Duration::minutes(5);
        let newer = snapshot(&entity, 0, None);
        let sliced = snapshot(&entity, 0, Some("exp:country"));
        let other_phase = snapshot(&entity, 1, None);

        for s in [older.clone(), newer.clone(), sliced, other_phase.clone()] {
            store.create_snapshot(s).await.unwrap();
        }

        let latest = store.find_latest_snapshot(&entity, Some(0)).await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);

        let any_phase = store.find_latest_snapshot(&entity, None).await.unwrap().unwrap();
        assert!(any_phase.id == newer.id || any_phase.id == other_phase.id);
        assert_ne!(any_phase.id, older.id);
    }

    #[tokio::test]
    async fn test_create_snapshot_rejects_duplicate_id() {
        let store = InMemoryStore::new();
        let s = snapshot(&EntityRef::experiment("exp_1", "org_1"), 0, None);

        store.create_snapshot(s.clone()).await.unwrap();
        let err = store.create_snapshot(s).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cached_query_lookup_respects_window_and_status() {
        let store = InMemoryStore::new();
        let running = QueryRecord::start(Uuid::new_v4(), "org_1", "ds_1", "traffic", "SELECT 1");
        store.create_query(running.clone()).await.unwrap();

        let since = Utc::now() - Duration::hours(1);
        assert!(store.find_cached_query("org_1", &running.fingerprint, since).await.unwrap().is_none());

        store.update_query(running.succeeded(vec![])).await.unwrap();
        let hit = store.find_cached_query("org_1", &running.fingerprint, since).await.unwrap();
        assert_eq!(hit.map(|q| q.id), Some(running.id));

        let future = Utc::now() + Duration::hours(1);
        assert!(store.find_cached_query("org_1", &running.fingerprint, future).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cached_query_lookup_is_scoped_to_organization() {
        let store = InMemoryStore::new();
        let query = QueryRecord::start(Uuid::new_v4(), "org_1", "ds_1", "traffic", "SELECT 1");
        store.create_query(query.clone()).await.unwrap();
        store.update_query(query.succeeded(vec![])).await.unwrap();

        let since = Utc::now() - Duration::hours(1);
        assert!(store.find_cached_query("org_2", &query.fingerprint, since).await.unwrap().is_none());
        assert!(store.find_cached_query("org_1", &query.fingerprint, since).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_running_snapshot_update_skips_final_snapshots() {
        let store = InMemoryStore::new();
        let running = snapshot(&EntityRef::experiment("exp_1", "org_1"), 0, None);
        store.create_snapshot(running.clone()).await.unwrap();

        // A cancel that read the snapshot while it was running...
        let stale = store.get_snapshot(running.id).await.unwrap().unwrap();
        assert_eq!(stale.status, SnapshotStatus::Running);

        // ...loses to a finalize that lands first.
        let finalized = store
            .update_running_snapshot(running.id, &|s| {
                s.finalized(SnapshotOutcome::without_results(SnapshotStatus::Succeeded, vec![], None))
            })
            .await
            .unwrap();
        assert!(matches!(finalized, SnapshotUpdate::Applied(ref s) if s.status == SnapshotStatus::Succeeded));

        let cancel = store.update_running_snapshot(running.id, &|s| s.cancelled()).await.unwrap();
        match cancel {
            SnapshotUpdate::AlreadyFinal(current) => assert_eq!(current.status, SnapshotStatus::Succeeded),
            other => panic!("cancel overwrote a final snapshot: {:?}", other),
        }

        let stored = store.get_snapshot(running.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SnapshotStatus::Succeeded);
        assert!(stored.finalized_at.is_some());

        let missing = store.update_running_snapshot(Uuid::new_v4(), &|s| s.cancelled()).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_update_missing_entity_is_not_found() {
        let store = InMemoryStore::new();
        let feature = Feature {
            id: "feat_1".to_string(),
            organization: "org_1".to_string(),
            date_updated: Utc::now(),
            never_stale: false,
            linked_experiments: vec![],
            is_stale: false,
        };

        let err = store.update_feature(feature.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "feature", .. }));

        store.insert_feature(feature.clone());
        store.update_feature(feature).await.unwrap();
        assert_eq!(store.list_organizations().await.unwrap(), vec!["org_1".to_string()]);
    }

    #[tokio::test]
    async fn test_default_organization_settings() {
        let store = InMemoryStore::new();
        let settings = store.get_organization_settings("org_9").await.unwrap();
        assert_eq!(settings.organization, "org_9");
        assert_eq!(settings.stats_engine, StatsEngineKind::Bayesian);
    }
}
