//! Error handling module
//!
//! `TrackerError` is what the engine and its collaborators return.
//! `AppError` is the HTTP-facing error of the service binary.

use crate::models::EntityId;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Engine error taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// Snapshot lacks its mandatory identity. Not retryable: the upstream
    /// record is corrupt and the entity is skipped for this cycle.
    #[error("Invalid snapshot for {entity_id}: {reason}")]
    InvalidSnapshot { entity_id: EntityId, reason: String },

    /// A collaborator (entity source, snapshot store, persistence) failed.
    /// Retryable by the caller with backoff.
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// Cancelled before anything was submitted
    #[error("Operation cancelled before submission")]
    Cancelled,
}

impl TrackerError {
    pub fn invalid_snapshot(entity_id: impl Into<EntityId>, reason: impl Into<String>) -> Self {
        TrackerError::InvalidSnapshot {
            entity_id: entity_id.into(),
            reason: reason.into(),
        }
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        TrackerError::Dependency(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackerError::Dependency(_) | TrackerError::Cancelled)
    }
}

impl From<tokio_postgres::Error> for TrackerError {
    fn from(e: tokio_postgres::Error) -> Self {
        TrackerError::Dependency(format!("database error: {}", e))
    }
}

impl From<deadpool_postgres::PoolError> for TrackerError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        TrackerError::Dependency(format!("database pool error: {}", e))
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::Dependency(format!("corrupt stored record: {}", e))
    }
}

/// Service error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<TrackerError> for AppError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::InvalidSnapshot { .. } => AppError::Validation(e.to_string()),
            TrackerError::Dependency(msg) => AppError::Dependency(msg),
            TrackerError::Cancelled => AppError::Cancelled(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                None,
            ),
            AppError::Dependency(msg) => {
                error!("Dependency error: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "DEPENDENCY_ERROR",
                    "A storage dependency is unavailable".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Cancelled(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CANCELLED",
                msg.clone(),
                None,
            ),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;
