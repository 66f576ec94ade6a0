//! Observation cycle
//!
//! `ChangeTracker` wires the collaborators to the engine: fetch current
//! snapshots, load the previous ones, compare, submit the resulting events,
//! and only then advance the snapshot store for entities whose events were
//! all persisted.
//!
//! Cycles touching the same entity run one after the other: each cycle holds
//! a per-entity lock from reading the previous snapshot until the new one is
//! stored. Locks are taken in entity id order so overlapping cycles cannot
//! deadlock.

use crate::config::TrackerConfig;
use crate::engine::batch::{BatchCoordinator, BatchResult};
use crate::engine::classify::EventBuilder;
use crate::engine::diff::DiffEngine;
use crate::engine::normalize::{normalize, NormalizedSnapshot};
use crate::engine::sequence::SequenceAllocator;
use crate::error::TrackerError;
use crate::models::{ChangeEvent, EntityId, EntitySnapshot, EntityState, EntityType};
use crate::store::{ChangeLog, EntitySource, SnapshotRecord, SnapshotStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Summary of one observation cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub entity_type: EntityType,
    pub observed_at: DateTime<Utc>,
    /// Seen for the first time; snapshot stored as baseline
    pub baselined: usize,
    pub unchanged: usize,
    pub changed: usize,
    /// Skipped for this cycle because the snapshot lacks a usable identity
    pub skipped_invalid: Vec<EntityId>,
    /// Requested ids the entity source had no record for
    pub missing: Vec<EntityId>,
    pub events_emitted: usize,
    pub snapshots_advanced: usize,
    /// Entities whose events were persisted but whose snapshot could not be
    /// stored
    pub snapshot_failures: Vec<EntityId>,
    pub batch: BatchResult,
}

// Snapshot waiting for its events to be persisted
struct PendingAdvance {
    snapshot: NormalizedSnapshot,
    last_sequence: u64,
    stored_sequence: u64,
}

/// One async lock per entity id with a cycle in flight
#[derive(Default)]
struct EntityLocks {
    locks: Mutex<HashMap<EntityId, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    /// Lock `entity_ids` in the order given
    async fn acquire<'a, I>(&self, entity_ids: I) -> Vec<OwnedMutexGuard<()>>
    where
        I: IntoIterator<Item = &'a EntityId>,
    {
        let handles: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // nobody holds or waits on these
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            entity_ids
                .into_iter()
                .map(|id| Arc::clone(locks.entry(id.clone()).or_default()))
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        guards
    }
}

pub struct ChangeTracker {
    source: Arc<dyn EntitySource>,
    snapshots: Arc<dyn SnapshotStore>,
    log: Arc<dyn ChangeLog>,
    allocator: SequenceAllocator,
    builder: EventBuilder,
    coordinator: BatchCoordinator,
    emit_first_observed: bool,
    locks: EntityLocks,
}

impl ChangeTracker {
    pub fn new(
        source: Arc<dyn EntitySource>,
        snapshots: Arc<dyn SnapshotStore>,
        log: Arc<dyn ChangeLog>,
        config: &TrackerConfig,
    ) -> Self {
        let coordinator = BatchCoordinator::new(Arc::clone(&log))
            .with_max_batch_size(config.max_batch_size)
            .with_submit_timeout(config.submit_timeout);

        Self {
            source,
            snapshots,
            log,
            allocator: SequenceAllocator::new(),
            builder: EventBuilder::new(config.grouping),
            coordinator,
            emit_first_observed: config.emit_first_observed,
            locks: EntityLocks::default(),
        }
    }

    /// Compare one entity's previous and current snapshot into events.
    ///
    /// Advances the sequence allocator for `entity_id` by the number of
    /// events returned.
    pub fn compare(
        &self,
        entity_id: &EntityId,
        previous: Option<&NormalizedSnapshot>,
        current: &NormalizedSnapshot,
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<ChangeEvent>, TrackerError> {
        let deltas = DiffEngine::diff(entity_id, previous, current)?;

        if previous.is_none() {
            if self.emit_first_observed {
                return Ok(vec![self.builder.first_observed(current, observed_at, &self.allocator)]);
            }
            return Ok(Vec::new());
        }

        Ok(self.builder.build(
            current.entity_type,
            entity_id,
            deltas,
            observed_at,
            &self.allocator,
        ))
    }

    /// Fetch `entity_ids` from the entity source and run a cycle over them
    pub async fn observe(
        &self,
        entity_type: EntityType,
        entity_ids: &[EntityId],
        cancel: &CancellationToken,
    ) -> Result<CycleReport, TrackerError> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TrackerError::Cancelled),
            fetched = self.source.fetch_batch(entity_type, entity_ids) => fetched?,
        };

        let found: HashSet<EntityId> = fetched.iter().map(|s| normalize(s).entity_id()).collect();
        let missing: Vec<EntityId> = entity_ids
            .iter()
            .filter(|id| !found.contains(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            debug!(entity_type = %entity_type, missing = missing.len(), "Entity source omitted ids");
        }

        self.run_cycle(entity_type, fetched, missing, cancel).await
    }

    /// Run a cycle over snapshots pushed by the caller. When one entity
    /// appears more than once the last snapshot wins.
    pub async fn observe_snapshots(
        &self,
        entity_type: EntityType,
        snapshots: Vec<EntitySnapshot>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, TrackerError> {
        self.run_cycle(entity_type, snapshots, Vec::new(), cancel).await
    }

    async fn run_cycle(
        &self,
        entity_type: EntityType,
        snapshots: Vec<EntitySnapshot>,
        missing: Vec<EntityId>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, TrackerError> {
        if cancel.is_cancelled() {
            return Err(TrackerError::Cancelled);
        }

        let mut current: BTreeMap<EntityId, NormalizedSnapshot> = BTreeMap::new();
        for snapshot in &snapshots {
            let normalized = normalize(snapshot);
            current.insert(normalized.entity_id(), normalized);
        }

        let _guards = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TrackerError::Cancelled),
            guards = self.locks.acquire(current.keys()) => guards,
        };
        let observed_at = Utc::now();

        let mut baselined = 0;
        let mut unchanged = 0;
        let mut changed = 0;
        let mut skipped_invalid = Vec::new();
        let mut pending: BTreeMap<EntityId, PendingAdvance> = BTreeMap::new();
        let mut events = Vec::new();

        for (entity_id, snapshot) in current {
            if snapshot.entity_type != entity_type {
                warn!(
                    entity_id = %entity_id,
                    expected = %entity_type,
                    actual = %snapshot.entity_type,
                    "Skipping snapshot of the wrong entity type"
                );
                skipped_invalid.push(entity_id);
                continue;
            }

            let previous = self.snapshots.get_last_known(&entity_id).await?;
            if let Some(record) = &previous {
                self.allocator.seed(&entity_id, record.last_sequence);
            }

            let entity_events = match self.compare(
                &entity_id,
                previous.as_ref().map(|r| &r.snapshot),
                &snapshot,
                observed_at,
            ) {
                Ok(entity_events) => entity_events,
                Err(e @ TrackerError::InvalidSnapshot { .. }) => {
                    warn!(entity_id = %entity_id, error = %e, "Skipping invalid snapshot");
                    skipped_invalid.push(entity_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let stored_sequence = previous.as_ref().map_or(0, |r| r.last_sequence);
            match (&previous, entity_events.is_empty()) {
                (None, _) => baselined += 1,
                (Some(_), true) => unchanged += 1,
                (Some(_), false) => changed += 1,
            }
            for event in &entity_events {
                debug!(
                    entity_id = %entity_id,
                    category = %event.category,
                    sequence_key = event.sequence_key,
                    deltas = event.deltas.len(),
                    "Change detected"
                );
            }

            let last_sequence = entity_events
                .iter()
                .map(|e| e.sequence_key)
                .max()
                .unwrap_or(0)
                .max(stored_sequence);
            pending.insert(
                entity_id,
                PendingAdvance {
                    snapshot,
                    last_sequence,
                    stored_sequence,
                },
            );
            events.extend(entity_events);
        }

        let events_emitted = events.len();
        let batch = self.coordinator.submit(events, cancel).await?;

        let failed: HashSet<EntityId> = batch.failed_ids().into_iter().collect();
        let mut snapshots_advanced = 0;
        let mut snapshot_failures = Vec::new();

        for (entity_id, advance) in pending {
            if failed.contains(&entity_id) {
                continue;
            }

            let record = SnapshotRecord {
                snapshot: advance.snapshot,
                last_sequence: advance.last_sequence,
                observed_at,
            };
            match self.snapshots.save_current(record).await {
                Ok(()) => snapshots_advanced += 1,
                Err(e) => {
                    // Events are persisted but the stored snapshot still
                    // predates them. Reissue the same keys so the next
                    // comparison lands on them as already present.
                    warn!(entity_id = %entity_id, error = %e, "Failed to advance snapshot");
                    self.allocator.rewind(&entity_id, advance.stored_sequence);
                    snapshot_failures.push(entity_id);
                }
            }
        }

        let report = CycleReport {
            entity_type,
            observed_at,
            baselined,
            unchanged,
            changed,
            skipped_invalid,
            missing,
            events_emitted,
            snapshots_advanced,
            snapshot_failures,
            batch,
        };

        info!(
            entity_type = %entity_type,
            batch_id = %report.batch.batch_id,
            baselined = report.baselined,
            unchanged = report.unchanged,
            changed = report.changed,
            skipped = report.skipped_invalid.len(),
            missing = report.missing.len(),
            events = report.events_emitted,
            failed = report.batch.failed.len(),
            "Observation cycle finished"
        );

        Ok(report)
    }

    pub async fn entity_state(&self, entity_id: &EntityId) -> Result<EntityState, TrackerError> {
        let record = self.snapshots.get_last_known(entity_id).await?;
        Ok(EntityState::from_last_sequence(record.map(|r| r.last_sequence)))
    }

    pub async fn last_known(&self, entity_id: &EntityId) -> Result<Option<SnapshotRecord>, TrackerError> {
        self.snapshots.get_last_known(entity_id).await
    }

    pub async fn history(
        &self,
        entity_id: &EntityId,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, TrackerError> {
        self.log.get_history(entity_id, limit).await
    }

    pub async fn recent(
        &self,
        entity_type: EntityType,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeEvent>, TrackerError> {
        self.log.get_recent(entity_type, since).await
    }
}
