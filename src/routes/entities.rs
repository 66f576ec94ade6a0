//! Change history routes

use crate::error::AppError;
use crate::models::{ChangeEvent, EntityId, EntityState, EntityType};
use crate::routes::observations::parse_entity_type;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

// ==================== Request/Response Types ====================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub success: bool,
    pub entity_id: EntityId,
    pub events: Vec<ChangeEvent>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    /// RFC 3339 timestamp, defaults to 24 hours ago
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentResponse {
    pub success: bool,
    pub entity_type: EntityType,
    pub since: DateTime<Utc>,
    pub events: Vec<ChangeEvent>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub success: bool,
    pub entity_id: EntityId,
    pub state: EntityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

// ==================== Handlers ====================

/// Most recent events of one entity, newest first
pub async fn history(
    State(state): State<SharedState>,
    Path(entity_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_HISTORY_LIMIT
        )));
    }

    let entity_id = EntityId::new(entity_id);
    let events = state.tracker.history(&entity_id, limit).await?;

    Ok(Json(HistoryResponse {
        success: true,
        entity_id,
        events,
    }))
}

pub async fn recent(
    State(state): State<SharedState>,
    Path(entity_type): Path<String>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<RecentResponse>, AppError> {
    let entity_type = parse_entity_type(&entity_type)?;
    let since = query.since.unwrap_or_else(|| Utc::now() - Duration::hours(24));
    let events = state.tracker.recent(entity_type, since).await?;

    Ok(Json(RecentResponse {
        success: true,
        entity_type,
        since,
        events,
    }))
}

/// Tracking state of one entity
pub async fn entity_state(
    State(state): State<SharedState>,
    Path(entity_id): Path<String>,
) -> Result<Json<StateResponse>, AppError> {
    let entity_id = EntityId::new(entity_id);
    let record = state.tracker.last_known(&entity_id).await?;

    let response = match record {
        Some(record) => StateResponse {
            success: true,
            state: record.state(),
            last_sequence: Some(record.last_sequence),
            observed_at: Some(record.observed_at),
            entity_id,
        },
        None => StateResponse {
            success: true,
            entity_id,
            state: EntityState::Unknown,
            last_sequence: None,
            observed_at: None,
        },
    };

    Ok(Json(response))
}
