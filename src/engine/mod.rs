//! Change detection engine
//!
//! Leaf to root: field comparators, snapshot normalizer, diff engine,
//! event builder with its sequence allocator, batch coordinator, and the
//! observation cycle that ties them to the collaborators.

pub mod batch;
pub mod classify;
pub mod compare;
pub mod diff;
pub mod normalize;
pub mod sequence;
pub mod tracker;

pub use batch::{BatchCoordinator, BatchResult, EntityFailure, EntityOutcome};
pub use classify::{EventBuilder, EventGrouping};
pub use diff::DiffEngine;
pub use normalize::{normalize, NormalizedSnapshot};
pub use sequence::SequenceAllocator;
pub use tracker::{ChangeTracker, CycleReport};
