//! Snapshot Diff Engine
//!
//! Compares the previous and current normalized snapshot of one entity and
//! collects field-level deltas in the fixed walk order of [`FieldId::TRACKED`].

use crate::engine::compare::{compare_optional, compare_set};
use crate::engine::normalize::NormalizedSnapshot;
use crate::error::TrackerError;
use crate::models::{EntityId, FieldDelta, FieldId};

/// The diff engine that compares entity snapshots
pub struct DiffEngine;

impl DiffEngine {
    /// Compare two snapshots of `entity_id`.
    ///
    /// An absent `previous` establishes a baseline and yields no deltas.
    /// Fails only when `current` lacks a usable identity.
    pub fn diff(
        entity_id: &EntityId,
        previous: Option<&NormalizedSnapshot>,
        current: &NormalizedSnapshot,
    ) -> Result<Vec<FieldDelta>, TrackerError> {
        Self::validate_identity(entity_id, current)?;

        let Some(previous) = previous else {
            return Ok(Vec::new());
        };

        let mut changes = Vec::new();
        for field in FieldId::TRACKED {
            if field.applies_to(current.entity_type) {
                Self::diff_field(field, previous, current, &mut changes);
            }
        }

        Ok(changes)
    }

    /// Mandatory identity: a well-formed registration number for the entity
    /// type, matching the id under comparison.
    pub fn validate_identity(
        entity_id: &EntityId,
        snapshot: &NormalizedSnapshot,
    ) -> Result<(), TrackerError> {
        let number = snapshot.registration_number.as_str();

        if number.is_empty() {
            return Err(TrackerError::invalid_snapshot(
                entity_id.clone(),
                "registration number is missing",
            ));
        }
        if !snapshot.entity_type.is_valid_registration_number(number) {
            return Err(TrackerError::invalid_snapshot(
                entity_id.clone(),
                format!(
                    "'{}' is not a valid {} registration number",
                    number, snapshot.entity_type
                ),
            ));
        }
        if number != entity_id.as_str() {
            return Err(TrackerError::invalid_snapshot(
                entity_id.clone(),
                format!("snapshot belongs to {}", number),
            ));
        }
        Ok(())
    }

    fn diff_field(
        field: FieldId,
        from: &NormalizedSnapshot,
        to: &NormalizedSnapshot,
        changes: &mut Vec<FieldDelta>,
    ) {
        let delta = match field {
            FieldId::RegistrationNumber => None,
            FieldId::Inn => compare_optional(field, from.inn.as_ref(), to.inn.as_ref()),
            FieldId::FullName => {
                compare_optional(field, from.full_name.as_ref(), to.full_name.as_ref())
            }
            FieldId::ShortName => {
                compare_optional(field, from.short_name.as_ref(), to.short_name.as_ref())
            }
            FieldId::RegisteredOn => {
                compare_optional(field, from.registered_on.as_ref(), to.registered_on.as_ref())
            }
            FieldId::Status => compare_optional(field, from.status.as_ref(), to.status.as_ref()),
            FieldId::Address => compare_optional(field, from.address.as_ref(), to.address.as_ref()),
            FieldId::MainActivity => {
                compare_optional(field, from.main_activity.as_ref(), to.main_activity.as_ref())
            }
            FieldId::AdditionalActivities => {
                changes.extend(compare_set(
                    field,
                    &from.additional_activities,
                    &to.additional_activities,
                ));
                None
            }
            FieldId::Founders => {
                changes.extend(compare_set(field, &from.founders, &to.founders));
                None
            }
            FieldId::Capital => compare_optional(field, from.capital.as_ref(), to.capital.as_ref()),
            FieldId::Head => compare_optional(field, from.head.as_ref(), to.head.as_ref()),
            FieldId::LicensesCount => compare_optional(
                field,
                from.licenses_count.as_ref(),
                to.licenses_count.as_ref(),
            ),
            FieldId::BranchesCount => compare_optional(
                field,
                from.branches_count.as_ref(),
                to.branches_count.as_ref(),
            ),
        };

        if let Some(delta) = delta {
            changes.push(delta);
        }
    }
}
