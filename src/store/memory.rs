//! In-memory collaborators
//!
//! Thread-safe stores backed by `tokio::sync::RwLock` maps. Used when the
//! service runs without a database, and by tests. The change log supports
//! fault injection so partial batch failures can be exercised.

use crate::error::TrackerError;
use crate::models::{ChangeEvent, EntityId, EntitySnapshot, EntityType};
use crate::store::{
    ChangeLog, EntitySource, PerEntityResult, SaveStatus, SnapshotRecord, SnapshotStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

// =============================================================================
// ENTITY SOURCE
// =============================================================================

/// Registry stand-in holding current snapshots
#[derive(Default)]
pub struct MemoryEntitySource {
    entities: RwLock<HashMap<(EntityType, EntityId), EntitySnapshot>>,
    unavailable: AtomicBool,
}

impl MemoryEntitySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the current snapshot of an entity
    pub async fn upsert(&self, snapshot: EntitySnapshot) {
        let key = (snapshot.entity_type, snapshot.entity_id());
        self.entities.write().await.insert(key, snapshot);
    }

    pub async fn remove(&self, entity_type: EntityType, entity_id: &EntityId) {
        self.entities
            .write()
            .await
            .remove(&(entity_type, entity_id.clone()));
    }

    /// Make every fetch fail with a dependency error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), TrackerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TrackerError::dependency("entity source unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl EntitySource for MemoryEntitySource {
    async fn fetch_current(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<EntitySnapshot>, TrackerError> {
        self.check_available()?;
        let entities = self.entities.read().await;
        Ok(entities.get(&(entity_type, entity_id.clone())).cloned())
    }

    async fn fetch_batch(
        &self,
        entity_type: EntityType,
        entity_ids: &[EntityId],
    ) -> Result<Vec<EntitySnapshot>, TrackerError> {
        self.check_available()?;
        let entities = self.entities.read().await;
        Ok(entity_ids
            .iter()
            .filter_map(|id| entities.get(&(entity_type, id.clone())).cloned())
            .collect())
    }
}

// =============================================================================
// SNAPSHOT STORE
// =============================================================================

#[derive(Default)]
pub struct MemorySnapshotStore {
    records: RwLock<HashMap<EntityId, SnapshotRecord>>,
    failing_saves: RwLock<HashSet<EntityId>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `save_current` for this entity
    pub async fn fail_next_save(&self, entity_id: &EntityId) {
        self.failing_saves.write().await.insert(entity_id.clone());
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get_last_known(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<SnapshotRecord>, TrackerError> {
        Ok(self.records.read().await.get(entity_id).cloned())
    }

    async fn save_current(&self, record: SnapshotRecord) -> Result<(), TrackerError> {
        let entity_id = record.entity_id();
        if self.failing_saves.write().await.remove(&entity_id) {
            return Err(TrackerError::dependency("snapshot store unavailable"));
        }
        debug!(
            entity_id = %entity_id,
            last_sequence = record.last_sequence,
            "Stored snapshot"
        );
        self.records.write().await.insert(entity_id, record);
        Ok(())
    }
}

// =============================================================================
// CHANGE LOG
// =============================================================================

/// Change history keyed by (entity id, sequence key)
#[derive(Default)]
pub struct MemoryChangeLog {
    events: RwLock<BTreeMap<(EntityId, u64), ChangeEvent>>,
    failing: RwLock<HashSet<EntityId>>,
    attempts: RwLock<HashMap<EntityId, usize>>,
    unavailable: AtomicBool,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every future save for this entity
    pub async fn fail_entity(&self, entity_id: &EntityId) {
        self.failing.write().await.insert(entity_id.clone());
    }

    pub async fn heal_entity(&self, entity_id: &EntityId) {
        self.failing.write().await.remove(entity_id);
    }

    /// Make whole `save_batch` calls fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many `save_batch` calls included this entity
    pub async fn save_attempts(&self, entity_id: &EntityId) -> usize {
        self.attempts.read().await.get(entity_id).copied().unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    async fn save_batch(
        &self,
        entity_type: EntityType,
        events: &[ChangeEvent],
    ) -> Result<PerEntityResult, TrackerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TrackerError::dependency("change log unavailable"));
        }

        let mut by_entity: BTreeMap<EntityId, Vec<&ChangeEvent>> = BTreeMap::new();
        for event in events {
            by_entity.entry(event.entity_id.clone()).or_default().push(event);
        }

        let failing = self.failing.read().await;
        let mut attempts = self.attempts.write().await;
        let mut stored = self.events.write().await;
        let mut result = PerEntityResult::new();

        for (entity_id, entity_events) in by_entity {
            *attempts.entry(entity_id.clone()).or_insert(0) += 1;

            if failing.contains(&entity_id) {
                result.insert(
                    entity_id,
                    SaveStatus::Failed {
                        reason: "injected failure".to_string(),
                    },
                );
                continue;
            }

            if let Some(mismatch) = entity_events.iter().find(|e| e.entity_type != entity_type) {
                result.insert(
                    entity_id,
                    SaveStatus::Failed {
                        reason: format!("event is for a {}", mismatch.entity_type),
                    },
                );
                continue;
            }

            let conflict = entity_events.iter().find(|e| {
                stored
                    .get(&(entity_id.clone(), e.sequence_key))
                    .is_some_and(|existing| existing.category != e.category || existing.deltas != e.deltas)
            });
            if let Some(conflict) = conflict {
                result.insert(
                    entity_id,
                    SaveStatus::Failed {
                        reason: format!(
                            "sequence key {} already holds a different event",
                            conflict.sequence_key
                        ),
                    },
                );
                continue;
            }

            let mut inserted = 0;
            let mut already_present = 0;
            for event in entity_events {
                let key = (entity_id.clone(), event.sequence_key);
                if stored.contains_key(&key) {
                    already_present += 1;
                } else {
                    stored.insert(key, event.clone());
                    inserted += 1;
                }
            }
            result.insert(
                entity_id,
                SaveStatus::Saved {
                    inserted,
                    already_present,
                },
            );
        }

        Ok(result)
    }

    async fn get_history(
        &self,
        entity_id: &EntityId,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, TrackerError> {
        let stored = self.events.read().await;
        Ok(stored
            .range((entity_id.clone(), 0)..=(entity_id.clone(), u64::MAX))
            .rev()
            .take(limit)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn get_recent(
        &self,
        entity_type: EntityType,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeEvent>, TrackerError> {
        let stored = self.events.read().await;
        let mut events: Vec<ChangeEvent> = stored
            .values()
            .filter(|e| e.entity_type == entity_type && e.observed_at >= since)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            (a.observed_at, &a.entity_id, a.sequence_key).cmp(&(b.observed_at, &b.entity_id, b.sequence_key))
        });
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::normalize::normalize;
    use crate::models::{ChangeCategory, FieldDelta, FieldId, FieldValue};
    use pretty_assertions::assert_eq;

    fn event(id: &str, sequence_key: u64, status: &str) -> ChangeEvent {
        ChangeEvent {
            entity_type: EntityType::Company,
            entity_id: EntityId::from(id),
            category: ChangeCategory::Status,
            deltas: vec![FieldDelta::modified(
                FieldId::Status,
                None,
                Some(FieldValue::Text(status.to_string())),
            )],
            observed_at: Utc::now(),
            sequence_key,
        }
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let log = MemoryChangeLog::new();
        let events = vec![event("1027700132195", 1, "active"), event("1027700132195", 2, "closed")];

        log.save_batch(EntityType::Company, &events).await.unwrap();
        let second = log.save_batch(EntityType::Company, &events).await.unwrap();

        assert_eq!(
            second.get(&EntityId::from("1027700132195")),
            Some(&SaveStatus::Saved { inserted: 0, already_present: 2 })
        );
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test]
    async fn test_conflicting_sequence_key_fails() {
        let log = MemoryChangeLog::new();
        log.save_batch(EntityType::Company, &[event("1027700132195", 1, "active")]).await.unwrap();

        let result = log
            .save_batch(EntityType::Company, &[event("1027700132195", 1, "closed")])
            .await
            .unwrap();

        assert!(matches!(
            result.get(&EntityId::from("1027700132195")),
            Some(SaveStatus::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_same_content_at_a_later_time_is_already_present() {
        let log = MemoryChangeLog::new();
        let first = event("1027700132195", 1, "active");
        log.save_batch(EntityType::Company, &[first.clone()]).await.unwrap();

        let mut again = first.clone();
        again.observed_at = first.observed_at + chrono::Duration::hours(1);
        let result = log.save_batch(EntityType::Company, &[again]).await.unwrap();

        assert_eq!(
            result.get(&EntityId::from("1027700132195")),
            Some(&SaveStatus::Saved { inserted: 0, already_present: 1 })
        );
        let history = log.get_history(&EntityId::from("1027700132195"), 10).await.unwrap();
        assert_eq!(history[0].observed_at, first.observed_at);
    }

    #[tokio::test]
    async fn test_history_is_descending_and_limited() {
        let log = MemoryChangeLog::new();
        let events: Vec<ChangeEvent> = (1..=5).map(|k| event("1027700132195", k, "s")).collect();
        log.save_batch(EntityType::Company, &events).await.unwrap();
        log.save_batch(EntityType::Company, &[event("1027739609391", 1, "s")]).await.unwrap();

        let history = log.get_history(&EntityId::from("1027700132195"), 3).await.unwrap();
        let keys: Vec<u64> = history.iter().map(|e| e.sequence_key).collect();

        assert_eq!(keys, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_recent_filters_by_type_and_time() {
        let log = MemoryChangeLog::new();
        let mut old = event("1027700132195", 1, "s");
        old.observed_at = Utc::now() - chrono::Duration::days(2);
        log.save_batch(EntityType::Company, &[old, event("1027700132195", 2, "t")]).await.unwrap();

        let since = Utc::now() - chrono::Duration::days(1);
        let recent = log.get_recent(EntityType::Company, since).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].sequence_key, 2);

        let none = log.get_recent(EntityType::Entrepreneur, since).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_source_omits_unknown_ids() {
        let source = MemoryEntitySource::new();
        source.upsert(EntitySnapshot::new(EntityType::Company, "1027700132195")).await;

        let ids = vec![EntityId::from("1027700132195"), EntityId::from("1027739609391")];
        let found = source.fetch_batch(EntityType::Company, &ids).await.unwrap();

        assert_eq!(found.len(), 1);
        assert!(source
            .fetch_current(EntityType::Entrepreneur, &ids[0])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_snapshot_store_round_trip() {
        let store = MemorySnapshotStore::new();
        let record = SnapshotRecord {
            snapshot: normalize(&EntitySnapshot::new(EntityType::Company, "1027700132195")),
            last_sequence: 3,
            observed_at: Utc::now(),
        };

        store.save_current(record.clone()).await.unwrap();
        let loaded = store.get_last_known(&EntityId::from("1027700132195")).await.unwrap();

        assert_eq!(loaded, Some(record));
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_store_fails_one_save() {
        let store = MemorySnapshotStore::new();
        let id = EntityId::from("1027700132195");
        let record = SnapshotRecord {
            snapshot: normalize(&EntitySnapshot::new(EntityType::Company, "1027700132195")),
            last_sequence: 0,
            observed_at: Utc::now(),
        };

        store.fail_next_save(&id).await;
        assert!(store.save_current(record.clone()).await.is_err());
        assert_eq!(store.count().await, 0);

        store.save_current(record).await.unwrap();
        assert_eq!(store.count().await, 1);
    }
}
