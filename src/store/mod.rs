//! Collaborator contracts
//!
//! The engine talks to three collaborators:
//! - [`EntitySource`] fetches current registry state
//! - [`SnapshotStore`] keeps the last known snapshot per entity
//! - [`ChangeLog`] persists change events and serves their history
//!
//! In-memory and PostgreSQL implementations live in the submodules.

pub mod memory;
pub mod postgres;
pub mod queries;

use crate::engine::normalize::NormalizedSnapshot;
use crate::error::TrackerError;
use crate::models::{ChangeEvent, EntityId, EntitySnapshot, EntityState, EntityType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use memory::{MemoryChangeLog, MemoryEntitySource, MemorySnapshotStore};
pub use postgres::{PgChangeLog, PgSnapshotStore};

/// Source of current registry state
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Current snapshot of one entity, `None` when the registry has no record
    async fn fetch_current(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<EntitySnapshot>, TrackerError>;

    /// Current snapshots of many entities. Unknown ids are silently left
    /// out; the caller reconciles.
    async fn fetch_batch(
        &self,
        entity_type: EntityType,
        entity_ids: &[EntityId],
    ) -> Result<Vec<EntitySnapshot>, TrackerError>;
}

/// Last known snapshot of an entity together with the highest sequence key
/// issued for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub snapshot: NormalizedSnapshot,
    pub last_sequence: u64,
    pub observed_at: DateTime<Utc>,
}

impl SnapshotRecord {
    pub fn entity_id(&self) -> EntityId {
        self.snapshot.entity_id()
    }

    pub fn state(&self) -> EntityState {
        EntityState::from_last_sequence(Some(self.last_sequence))
    }
}

/// Storage of the "previous" side of the next comparison
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_last_known(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<SnapshotRecord>, TrackerError>;

    /// Replace the stored record for the entity
    async fn save_current(&self, record: SnapshotRecord) -> Result<(), TrackerError>;
}

/// Per-entity outcome of one `save_batch` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveStatus {
    Saved {
        inserted: usize,
        /// Events already stored under the same (entity, sequence key)
        already_present: usize,
    },
    Failed {
        reason: String,
    },
}

pub type PerEntityResult = BTreeMap<EntityId, SaveStatus>;

/// Append-only change history.
///
/// Saving must be idempotent per (entity id, sequence key): re-saving an
/// event that is already stored succeeds without writing a duplicate.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    async fn save_batch(
        &self,
        entity_type: EntityType,
        events: &[ChangeEvent],
    ) -> Result<PerEntityResult, TrackerError>;

    /// Most recent events of an entity, sequence key descending
    async fn get_history(
        &self,
        entity_id: &EntityId,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, TrackerError>;

    /// Events of one entity type observed at or after `since`
    async fn get_recent(
        &self,
        entity_type: EntityType,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeEvent>, TrackerError>;
}
