//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::engine::ChangeTracker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Which stores back the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Postgres => "postgres",
            StorageBackend::Memory => "memory",
        }
    }
}

/// Application state shared across all handlers
pub struct AppState {
    pub tracker: ChangeTracker,

    pub storage: StorageBackend,

    /// Cancelled on shutdown; every request derives its own child token
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(tracker: ChangeTracker, storage: StorageBackend) -> Self {
        Self {
            tracker,
            storage,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
