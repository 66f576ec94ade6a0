//! Change classifier / event builder
//!
//! Groups the deltas of one comparison into typed change events and stamps
//! them with sequence keys in category order.

use crate::engine::normalize::NormalizedSnapshot;
use crate::engine::sequence::SequenceAllocator;
use crate::models::{
    ChangeCategory, ChangeEvent, EntityId, EntityType, FieldDelta, FieldId, FieldValue,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How deltas of one comparison become events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventGrouping {
    /// One event per non-empty category
    #[default]
    PerCategory,
    /// One `composite` event holding every delta
    Composite,
}

impl std::str::FromStr for EventGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_category" => Ok(EventGrouping::PerCategory),
            "composite" => Ok(EventGrouping::Composite),
            other => Err(format!("unknown event grouping '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    grouping: EventGrouping,
}

impl EventBuilder {
    pub fn new(grouping: EventGrouping) -> Self {
        Self { grouping }
    }

    pub fn grouping(&self) -> EventGrouping {
        self.grouping
    }

    /// Turn deltas into events.
    ///
    /// Output order depends only on the delta contents, never on the order
    /// they were accumulated in. Advances the allocator by the number of
    /// events returned.
    pub fn build(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        deltas: Vec<FieldDelta>,
        observed_at: DateTime<Utc>,
        allocator: &SequenceAllocator,
    ) -> Vec<ChangeEvent> {
        let mut groups: BTreeMap<ChangeCategory, Vec<FieldDelta>> = BTreeMap::new();
        for delta in deltas.into_iter().filter(|d| !d.is_empty()) {
            let category = match self.grouping {
                EventGrouping::PerCategory => delta.category(),
                EventGrouping::Composite => ChangeCategory::Composite,
            };
            groups.entry(category).or_default().push(delta);
        }

        if groups.is_empty() {
            return Vec::new();
        }

        let keys = allocator.reserve(entity_id, groups.len() as u64);

        groups
            .into_iter()
            .zip(keys)
            .map(|((category, mut deltas), sequence_key)| {
                deltas.sort_by(|a, b| {
                    (a.category(), a.field, &a.key).cmp(&(b.category(), b.field, &b.key))
                });
                ChangeEvent {
                    entity_type,
                    entity_id: entity_id.clone(),
                    category,
                    deltas,
                    observed_at,
                    sequence_key,
                }
            })
            .collect()
    }

    /// Event announcing an entity seen for the first time
    pub fn first_observed(
        &self,
        snapshot: &NormalizedSnapshot,
        observed_at: DateTime<Utc>,
        allocator: &SequenceAllocator,
    ) -> ChangeEvent {
        let entity_id = snapshot.entity_id();
        let delta = FieldDelta::added(
            FieldId::RegistrationNumber,
            snapshot.registration_number.clone(),
            FieldValue::Text(snapshot.registration_number.clone()),
        );

        ChangeEvent {
            entity_type: snapshot.entity_type,
            sequence_key: allocator.next(&entity_id),
            entity_id,
            category: ChangeCategory::FirstObserved,
            deltas: vec![delta],
            observed_at,
        }
    }
}
