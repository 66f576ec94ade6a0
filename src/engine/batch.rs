//! Batch Coordinator
//!
//! Drives change events across the persistence boundary:
//! - drops repeated identical events within one submission
//! - partitions by entity type, then by entity
//! - chunks into bounded `save_batch` calls, never splitting an entity
//! - reports per-entity success or failure without re-submitting successes
//!
//! Every call to the change log is raced against the cancellation token and
//! the submit deadline.

use crate::error::TrackerError;
use crate::models::{ChangeEvent, EntityId, EntityType};
use crate::store::{ChangeLog, PerEntityResult, SaveStatus};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

const CANCELLED_BEFORE: &str = "cancelled before submission";
const CANCELLED_DURING: &str = "cancelled during submission; outcome unknown";
const DEADLINE_EXCEEDED: &str = "deadline exceeded";
const NOT_ACKNOWLEDGED: &str = "change log did not report an outcome";

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Events of one entity that reached the change log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityOutcome {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub sequence_keys: Vec<u64>,
    pub inserted: usize,
    pub already_present: usize,
}

/// Events of one entity that did not. `events` is what a retry resubmits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFailure {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub reason: String,
    pub sequence_keys: Vec<u64>,
    #[serde(skip)]
    pub events: Vec<ChangeEvent>,
}

/// Outcome of one `submit` call.
///
/// A partial failure is not an error: succeeded and failed entities are
/// partitioned here and the caller decides what to retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub submitted: usize,
    pub deduplicated: usize,
    pub succeeded: Vec<EntityOutcome>,
    pub failed: Vec<EntityFailure>,
}

impl BatchResult {
    fn empty(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            submitted: 0,
            deduplicated: 0,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Events to hand back to `submit` on retry
    pub fn failed_events(&self) -> Vec<ChangeEvent> {
        self.failed
            .iter()
            .flat_map(|f| f.events.iter().cloned())
            .collect()
    }

    pub fn succeeded_ids(&self) -> Vec<EntityId> {
        self.succeeded.iter().map(|s| s.entity_id.clone()).collect()
    }

    pub fn failed_ids(&self) -> Vec<EntityId> {
        self.failed.iter().map(|f| f.entity_id.clone()).collect()
    }
}

// How one chunk ended
enum ChunkOutcome {
    Completed(PerEntityResult),
    Failed(String),
    Interrupted,
    NotAttempted,
}

type EntityGroup = (EntityId, Vec<ChangeEvent>);

// =============================================================================
// COORDINATOR
// =============================================================================

pub struct BatchCoordinator {
    log: Arc<dyn ChangeLog>,
    max_batch_size: usize,
    submit_timeout: Duration,
}

impl BatchCoordinator {
    pub fn new(log: Arc<dyn ChangeLog>) -> Self {
        Self {
            log,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_submit_timeout(mut self, submit_timeout: Duration) -> Self {
        self.submit_timeout = submit_timeout;
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Persist `events`.
    ///
    /// Returns `Cancelled` only when the token fired before anything was
    /// sent. Once submission has started, every entity ends up in exactly
    /// one of `succeeded` or `failed`.
    pub async fn submit(
        &self,
        events: Vec<ChangeEvent>,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, TrackerError> {
        if cancel.is_cancelled() {
            return Err(TrackerError::Cancelled);
        }

        let batch_id = Uuid::new_v4();
        if events.is_empty() {
            return Ok(BatchResult::empty(batch_id));
        }

        let submitted = events.len();
        let (unique, deduplicated) = Self::deduplicate(events);
        let mut result = BatchResult {
            batch_id,
            submitted,
            deduplicated,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        for (entity_type, groups) in Self::partition(unique) {
            for chunk in Self::chunk(groups, self.max_batch_size) {
                let outcome = self.submit_chunk(entity_type, &chunk, cancel).await;
                Self::record(&mut result, entity_type, chunk, outcome);
            }
        }

        for failure in &result.failed {
            warn!(
                batch_id = %batch_id,
                entity_id = %failure.entity_id,
                events = failure.events.len(),
                reason = %failure.reason,
                "Change events not persisted"
            );
        }
        info!(
            batch_id = %batch_id,
            submitted = result.submitted,
            deduplicated = result.deduplicated,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "Batch submitted"
        );

        Ok(result)
    }

    /// Keep the first of every set of identical events, in input order
    fn deduplicate(events: Vec<ChangeEvent>) -> (Vec<ChangeEvent>, usize) {
        let mut seen = HashSet::new();
        let total = events.len();
        let unique: Vec<ChangeEvent> = events
            .into_iter()
            .filter(|e| seen.insert(e.fingerprint()))
            .collect();
        let dropped = total - unique.len();
        (unique, dropped)
    }

    fn partition(events: Vec<ChangeEvent>) -> BTreeMap<EntityType, Vec<EntityGroup>> {
        let mut by_type: BTreeMap<EntityType, BTreeMap<EntityId, Vec<ChangeEvent>>> =
            BTreeMap::new();
        for event in events {
            by_type
                .entry(event.entity_type)
                .or_default()
                .entry(event.entity_id.clone())
                .or_default()
                .push(event);
        }

        by_type
            .into_iter()
            .map(|(entity_type, entities)| {
                let groups = entities
                    .into_iter()
                    .map(|(id, mut events)| {
                        events.sort_by_key(|e| e.sequence_key);
                        (id, events)
                    })
                    .collect();
                (entity_type, groups)
            })
            .collect()
    }

    /// Pack whole entity groups into chunks of at most `max` events. A
    /// single group larger than `max` becomes a chunk of its own.
    fn chunk(groups: Vec<EntityGroup>, max: usize) -> Vec<Vec<EntityGroup>> {
        let mut chunks = Vec::new();
        let mut current: Vec<EntityGroup> = Vec::new();
        let mut current_len = 0;

        for group in groups {
            let len = group.1.len();
            if !current.is_empty() && current_len + len > max {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current_len += len;
            current.push(group);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    async fn submit_chunk(
        &self,
        entity_type: EntityType,
        chunk: &[EntityGroup],
        cancel: &CancellationToken,
    ) -> ChunkOutcome {
        if cancel.is_cancelled() {
            return ChunkOutcome::NotAttempted;
        }

        let events: Vec<ChangeEvent> = chunk
            .iter()
            .flat_map(|(_, events)| events.iter().cloned())
            .collect();
        debug!(
            entity_type = %entity_type,
            entities = chunk.len(),
            events = events.len(),
            "Submitting chunk"
        );

        let save = tokio::time::timeout(
            self.submit_timeout,
            self.log.save_batch(entity_type, &events),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => ChunkOutcome::Interrupted,
            result = save => match result {
                Ok(Ok(per_entity)) => ChunkOutcome::Completed(per_entity),
                Ok(Err(e)) => ChunkOutcome::Failed(e.to_string()),
                Err(_) => ChunkOutcome::Failed(DEADLINE_EXCEEDED.to_string()),
            },
        }
    }

    fn record(
        result: &mut BatchResult,
        entity_type: EntityType,
        chunk: Vec<EntityGroup>,
        outcome: ChunkOutcome,
    ) {
        let mut acknowledged = match outcome {
            ChunkOutcome::Completed(per_entity) => Ok(per_entity),
            ChunkOutcome::Failed(reason) => Err(reason),
            ChunkOutcome::Interrupted => Err(CANCELLED_DURING.to_string()),
            ChunkOutcome::NotAttempted => Err(CANCELLED_BEFORE.to_string()),
        };

        for (entity_id, events) in chunk {
            let sequence_keys: Vec<u64> = events.iter().map(|e| e.sequence_key).collect();
            let status = match &mut acknowledged {
                Ok(per_entity) => per_entity.remove(&entity_id).unwrap_or(SaveStatus::Failed {
                    reason: NOT_ACKNOWLEDGED.to_string(),
                }),
                Err(reason) => SaveStatus::Failed {
                    reason: reason.clone(),
                },
            };

            match status {
                SaveStatus::Saved {
                    inserted,
                    already_present,
                } => result.succeeded.push(EntityOutcome {
                    entity_type,
                    entity_id,
                    sequence_keys,
                    inserted,
                    already_present,
                }),
                SaveStatus::Failed { reason } => result.failed.push(EntityFailure {
                    entity_type,
                    entity_id,
                    reason,
                    sequence_keys,
                    events,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeCategory, FieldDelta, FieldId, FieldValue};
    use crate::store::MemoryChangeLog;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    const FIRST: &str = "1027700132195";
    const SECOND: &str = "1027739609391";
    const THIRD: &str = "1037739010891";

    fn event(entity_type: EntityType, id: &str, sequence_key: u64, status: &str) -> ChangeEvent {
        ChangeEvent {
            entity_type,
            entity_id: EntityId::from(id),
            category: ChangeCategory::Status,
            deltas: vec![FieldDelta::modified(
                FieldId::Status,
                Some(FieldValue::Text("active".to_string())),
                Some(FieldValue::Text(status.to_string())),
            )],
            observed_at: Utc::now(),
            sequence_key,
        }
    }

    fn company(id: &str, sequence_key: u64) -> ChangeEvent {
        event(EntityType::Company, id, sequence_key, "liquidating")
    }

    // Records the size of every save_batch call
    #[derive(Default)]
    struct RecordingLog {
        inner: MemoryChangeLog,
        calls: Mutex<Vec<(EntityType, usize)>>,
    }

    #[async_trait]
    impl ChangeLog for RecordingLog {
        async fn save_batch(
            &self,
            entity_type: EntityType,
            events: &[ChangeEvent],
        ) -> Result<PerEntityResult, TrackerError> {
            self.calls.lock().unwrap().push((entity_type, events.len()));
            self.inner.save_batch(entity_type, events).await
        }

        async fn get_history(&self, id: &EntityId, limit: usize) -> Result<Vec<ChangeEvent>, TrackerError> {
            self.inner.get_history(id, limit).await
        }

        async fn get_recent(&self, t: EntityType, since: DateTime<Utc>) -> Result<Vec<ChangeEvent>, TrackerError> {
            self.inner.get_recent(t, since).await
        }
    }

    // Never answers
    struct StallingLog;

    #[async_trait]
    impl ChangeLog for StallingLog {
        async fn save_batch(&self, _: EntityType, _: &[ChangeEvent]) -> Result<PerEntityResult, TrackerError> {
            std::future::pending().await
        }

        async fn get_history(&self, _: &EntityId, _: usize) -> Result<Vec<ChangeEvent>, TrackerError> {
            Ok(Vec::new())
        }

        async fn get_recent(&self, _: EntityType, _: DateTime<Utc>) -> Result<Vec<ChangeEvent>, TrackerError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_partial_failure_reports_each_entity() {
        let log = Arc::new(MemoryChangeLog::new());
        log.fail_entity(&EntityId::from(SECOND)).await;
        let coordinator = BatchCoordinator::new(log.clone());

        let events = vec![company(FIRST, 1), company(SECOND, 1), company(THIRD, 1)];
        let result = coordinator.submit(events, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.succeeded_ids(), vec![EntityId::from(FIRST), EntityId::from(THIRD)]);
        assert_eq!(result.failed_ids(), vec![EntityId::from(SECOND)]);
        assert!(result.has_failures());

        // Retrying the failure leaves the successes alone
        log.heal_entity(&EntityId::from(SECOND)).await;
        let retry = coordinator
            .submit(result.failed_events(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(retry.is_complete());
        assert_eq!(retry.succeeded_ids(), vec![EntityId::from(SECOND)]);
        assert_eq!(log.save_attempts(&EntityId::from(FIRST)).await, 1);
        assert_eq!(log.save_attempts(&EntityId::from(THIRD)).await, 1);
        assert_eq!(log.save_attempts(&EntityId::from(SECOND)).await, 2);
        assert_eq!(log.len().await, 3);
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let log = Arc::new(MemoryChangeLog::new());
        let coordinator = BatchCoordinator::new(log.clone());
        let events = vec![company(FIRST, 1), company(FIRST, 2)];

        coordinator.submit(events.clone(), &CancellationToken::new()).await.unwrap();
        let second = coordinator.submit(events, &CancellationToken::new()).await.unwrap();

        assert!(second.is_complete());
        assert_eq!(second.succeeded[0].inserted, 0);
        assert_eq!(second.succeeded[0].already_present, 2);
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test]
    async fn test_identical_events_are_deduplicated() {
        let log = Arc::new(MemoryChangeLog::new());
        let coordinator = BatchCoordinator::new(log.clone());
        let duplicate = company(FIRST, 1);

        let result = coordinator
            .submit(vec![duplicate.clone(), duplicate, company(SECOND, 1)], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.submitted, 3);
        assert_eq!(result.deduplicated, 1);
        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test]
    async fn test_partitions_by_entity_type() {
        let log = Arc::new(RecordingLog::default());
        let coordinator = BatchCoordinator::new(log.clone());
        let events = vec![
            company(FIRST, 1),
            event(EntityType::Entrepreneur, "304500116000157", 1, "closed"),
            company(SECOND, 1),
        ];

        let result = coordinator.submit(events, &CancellationToken::new()).await.unwrap();

        assert!(result.is_complete());
        let calls = log.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(EntityType::Company, 2), (EntityType::Entrepreneur, 1)]);
    }

    #[tokio::test]
    async fn test_chunks_never_split_an_entity() {
        let log = Arc::new(RecordingLog::default());
        let coordinator = BatchCoordinator::new(log.clone()).with_max_batch_size(3);
        let events = vec![
            company(FIRST, 1),
            company(FIRST, 2),
            company(SECOND, 1),
            company(SECOND, 2),
            company(THIRD, 1),
        ];

        let result = coordinator.submit(events, &CancellationToken::new()).await.unwrap();

        assert!(result.is_complete());
        let sizes: Vec<usize> = log.calls.lock().unwrap().iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_before_submission() {
        let log = Arc::new(MemoryChangeLog::new());
        let coordinator = BatchCoordinator::new(log.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = coordinator.submit(vec![company(FIRST, 1)], &cancel).await;

        assert_eq!(result, Err(TrackerError::Cancelled));
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancelled_during_submission() {
        let coordinator = BatchCoordinator::new(Arc::new(StallingLog)).with_max_batch_size(1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = coordinator
            .submit(vec![company(FIRST, 1), company(SECOND, 1)], &cancel)
            .await
            .unwrap();

        assert!(result.succeeded.is_empty());
        let reasons: Vec<&str> = result.failed.iter().map(|f| f.reason.as_str()).collect();
        assert_eq!(reasons, vec![CANCELLED_DURING, CANCELLED_BEFORE]);
        assert_eq!(result.failed_events().len(), 2);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let coordinator = BatchCoordinator::new(Arc::new(StallingLog))
            .with_submit_timeout(Duration::from_millis(20));

        let result = coordinator
            .submit(vec![company(FIRST, 1)], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].reason, DEADLINE_EXCEEDED);
    }

    #[tokio::test]
    async fn test_unavailable_log_fails_every_entity() {
        let log = Arc::new(MemoryChangeLog::new());
        log.set_unavailable(true);
        let coordinator = BatchCoordinator::new(log);

        let result = coordinator
            .submit(vec![company(FIRST, 1), company(SECOND, 1)], &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.succeeded.is_empty());
        assert_eq!(result.failed.len(), 2);
        assert!(result.failed[0].reason.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_empty_submission() {
        let coordinator = BatchCoordinator::new(Arc::new(MemoryChangeLog::new()));
        let result = coordinator.submit(Vec::new(), &CancellationToken::new()).await.unwrap();

        assert!(result.is_complete());
        assert_eq!(result.submitted, 0);
    }
}
