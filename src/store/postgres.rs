// PostgreSQL-backed snapshot store and change log
//
// Each entity of a batch is written in its own transaction, so one entity's
// failure never takes down the rest of the batch.

use crate::engine::normalize::NormalizedSnapshot;
use crate::error::TrackerError;
use crate::models::{ChangeCategory, ChangeEvent, EntityId, EntityType, FieldDelta};
use crate::store::queries;
use crate::store::{
    ChangeLog, PerEntityResult, SaveStatus, SnapshotRecord, SnapshotStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use std::collections::BTreeMap;
use tokio_postgres::Row;
use tracing::{debug, warn};

fn to_db_sequence(key: u64) -> Result<i64, TrackerError> {
    i64::try_from(key).map_err(|_| TrackerError::dependency(format!("sequence key {} out of range", key)))
}

fn from_db_sequence(key: i64) -> Result<u64, TrackerError> {
    u64::try_from(key).map_err(|_| TrackerError::dependency(format!("negative sequence key {}", key)))
}

// Map a change_events row to an event
fn event_from_row(row: &Row) -> Result<ChangeEvent, TrackerError> {
    let entity_type: String = row.try_get("entity_type")?;
    let category: String = row.try_get("category")?;
    let deltas: serde_json::Value = row.try_get("deltas")?;

    Ok(ChangeEvent {
        entity_type: entity_type.parse().map_err(TrackerError::Dependency)?,
        entity_id: EntityId::new(row.try_get::<_, String>("entity_id")?),
        category: category.parse().map_err(TrackerError::Dependency)?,
        deltas: serde_json::from_value(deltas)?,
        observed_at: row.try_get("observed_at")?,
        sequence_key: from_db_sequence(row.try_get("sequence_key")?)?,
    })
}

// Snapshot store
pub struct PgSnapshotStore {
    pool: Pool,
}

impl PgSnapshotStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn get_last_known(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<SnapshotRecord>, TrackerError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(queries::GET_SNAPSHOT, &[&entity_id.as_str()])
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let snapshot: serde_json::Value = row.try_get("snapshot")?;
        let snapshot: NormalizedSnapshot = serde_json::from_value(snapshot)?;
        Ok(Some(SnapshotRecord {
            snapshot,
            last_sequence: from_db_sequence(row.try_get("last_sequence")?)?,
            observed_at: row.try_get("observed_at")?,
        }))
    }

    async fn save_current(&self, record: SnapshotRecord) -> Result<(), TrackerError> {
        let client = self.pool.get().await?;
        let snapshot = serde_json::to_value(&record.snapshot)?;
        let entity_id = record.entity_id();

        client
            .execute(
                queries::UPSERT_SNAPSHOT,
                &[
                    &entity_id.as_str(),
                    &record.snapshot.entity_type.as_str(),
                    &snapshot,
                    &to_db_sequence(record.last_sequence)?,
                    &record.observed_at,
                ],
            )
            .await?;

        debug!(entity_id = %entity_id, last_sequence = record.last_sequence, "Stored snapshot");
        Ok(())
    }
}

// Change log
pub struct PgChangeLog {
    pool: Pool,
}

impl PgChangeLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn save_entity(
        client: &mut Object,
        entity_type: EntityType,
        events: &[&ChangeEvent],
    ) -> Result<SaveStatus, TrackerError> {
        if let Some(mismatch) = events.iter().find(|e| e.entity_type != entity_type) {
            return Ok(SaveStatus::Failed {
                reason: format!("event is for a {}", mismatch.entity_type),
            });
        }

        let tx = client.transaction().await?;
        let mut inserted = 0;
        let mut already_present = 0;

        for event in events {
            let sequence_key = to_db_sequence(event.sequence_key)?;
            let deltas = serde_json::to_value(&event.deltas)?;

            let written = tx
                .execute(
                    queries::INSERT_EVENT,
                    &[
                        &event.entity_id.as_str(),
                        &sequence_key,
                        &event.entity_type.as_str(),
                        &event.category.as_str(),
                        &deltas,
                        &event.observed_at,
                    ],
                )
                .await?;

            if written == 1 {
                inserted += 1;
                continue;
            }

            // Key taken: fine if it holds this very event, a conflict otherwise
            let row = tx
                .query_one(
                    queries::GET_EVENT_CONTENT,
                    &[&event.entity_id.as_str(), &sequence_key],
                )
                .await?;
            let stored_category: String = row.try_get("category")?;
            let stored_deltas: serde_json::Value = row.try_get("deltas")?;
            let stored_deltas: Vec<FieldDelta> = serde_json::from_value(stored_deltas)?;
            let same_category = stored_category.parse::<ChangeCategory>().ok() == Some(event.category);

            if !same_category || stored_deltas != event.deltas {
                return Ok(SaveStatus::Failed {
                    reason: format!(
                        "sequence key {} already holds a different event",
                        event.sequence_key
                    ),
                });
            }
            already_present += 1;
        }

        tx.commit().await?;
        Ok(SaveStatus::Saved {
            inserted,
            already_present,
        })
    }
}

#[async_trait]
impl ChangeLog for PgChangeLog {
    async fn save_batch(
        &self,
        entity_type: EntityType,
        events: &[ChangeEvent],
    ) -> Result<PerEntityResult, TrackerError> {
        let mut by_entity: BTreeMap<EntityId, Vec<&ChangeEvent>> = BTreeMap::new();
        for event in events {
            by_entity.entry(event.entity_id.clone()).or_default().push(event);
        }

        let mut client = self.pool.get().await?;
        let mut result = PerEntityResult::new();

        for (entity_id, entity_events) in by_entity {
            let status = match Self::save_entity(&mut client, entity_type, &entity_events).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "Failed to persist change events");
                    SaveStatus::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            result.insert(entity_id, status);
        }

        Ok(result)
    }

    async fn get_history(
        &self,
        entity_id: &EntityId,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, TrackerError> {
        let client = self.pool.get().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(queries::GET_HISTORY, &[&entity_id.as_str(), &limit])
            .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn get_recent(
        &self,
        entity_type: EntityType,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeEvent>, TrackerError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(queries::GET_RECENT, &[&entity_type.as_str(), &since])
            .await?;

        rows.iter().map(event_from_row).collect()
    }
}
