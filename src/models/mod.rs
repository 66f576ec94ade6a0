//! Domain models
//!
//! Registry snapshots and the change records derived from them.

pub mod event;
pub mod snapshot;

pub use event::{
    ChangeCategory, ChangeEvent, DeltaKind, EntityState, FieldDelta, FieldId, FieldValue,
};
pub use snapshot::{
    ActivityCode, Address, Capital, EntityId, EntitySnapshot, EntityType, Founder, Person,
};
