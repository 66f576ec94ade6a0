//! Observation ingest route
//!
//! Callers push the current snapshots of a batch of entities; the service
//! runs one observation cycle over them and answers with the cycle report.

use crate::engine::CycleReport;
use crate::error::AppError;
use crate::models::{EntitySnapshot, EntityType};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

/// Upper bound on snapshots per request
const MAX_SNAPSHOTS_PER_REQUEST: usize = 10_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserveRequest {
    pub snapshots: Vec<EntitySnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserveResponse {
    pub success: bool,
    pub message: String,
    pub report: CycleReport,
}

pub(crate) fn parse_entity_type(raw: &str) -> Result<EntityType, AppError> {
    raw.parse().map_err(AppError::BadRequest)
}

/// Run one observation cycle over pushed snapshots.
///
/// `success` is false when some entities' events could not be persisted;
/// the report lists them and the next cycle compares them again.
pub async fn observe(
    State(state): State<SharedState>,
    Path(entity_type): Path<String>,
    Json(req): Json<ObserveRequest>,
) -> Result<Json<ObserveResponse>, AppError> {
    let entity_type = parse_entity_type(&entity_type)?;

    if req.snapshots.is_empty() {
        return Err(AppError::Validation("snapshots must not be empty".to_string()));
    }
    if req.snapshots.len() > MAX_SNAPSHOTS_PER_REQUEST {
        return Err(AppError::Validation(format!(
            "at most {} snapshots per request",
            MAX_SNAPSHOTS_PER_REQUEST
        )));
    }

    let cancel = state.shutdown.child_token();
    let report = state
        .tracker
        .observe_snapshots(entity_type, req.snapshots, &cancel)
        .await?;

    let message = if report.batch.is_complete() {
        format!(
            "{} changed, {} unchanged, {} baselined",
            report.changed, report.unchanged, report.baselined
        )
    } else {
        format!(
            "{} of {} entities failed to persist",
            report.batch.failed.len(),
            report.batch.failed.len() + report.batch.succeeded.len()
        )
    };

    Ok(Json(ObserveResponse {
        success: report.batch.is_complete(),
        message,
        report,
    }))
}
