//! Field deltas and change events
//!
//! A [`FieldDelta`] is a single difference between two normalized snapshots.
//! Deltas are grouped by [`ChangeCategory`] into [`ChangeEvent`]s, the durable
//! records written to the change history.

use crate::models::snapshot::{
    ActivityCode, Address, Capital, EntityId, EntityType, Founder, Person,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Tracked field of an entity snapshot.
///
/// Declaration order is the canonical walk order of the diff engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldId {
    RegistrationNumber,
    Inn,
    FullName,
    ShortName,
    RegisteredOn,
    Status,
    Address,
    MainActivity,
    AdditionalActivities,
    Founders,
    Capital,
    Head,
    LicensesCount,
    BranchesCount,
}

impl FieldId {
    /// Fields compared on every observation, in walk order
    pub const TRACKED: [FieldId; 13] = [
        FieldId::Inn,
        FieldId::FullName,
        FieldId::ShortName,
        FieldId::RegisteredOn,
        FieldId::Status,
        FieldId::Address,
        FieldId::MainActivity,
        FieldId::AdditionalActivities,
        FieldId::Founders,
        FieldId::Capital,
        FieldId::Head,
        FieldId::LicensesCount,
        FieldId::BranchesCount,
    ];

    pub fn category(&self) -> ChangeCategory {
        match self {
            FieldId::RegistrationNumber
            | FieldId::Inn
            | FieldId::FullName
            | FieldId::ShortName
            | FieldId::RegisteredOn => ChangeCategory::Identity,
            FieldId::Status => ChangeCategory::Status,
            FieldId::Address => ChangeCategory::Address,
            FieldId::MainActivity | FieldId::AdditionalActivities => ChangeCategory::Activity,
            FieldId::Founders => ChangeCategory::Founders,
            FieldId::Capital => ChangeCategory::Capital,
            FieldId::Head => ChangeCategory::Head,
            FieldId::LicensesCount => ChangeCategory::Licenses,
            FieldId::BranchesCount => ChangeCategory::Branches,
        }
    }

    /// Founders, capital, head and branches exist only for companies
    pub fn applies_to(&self, entity_type: EntityType) -> bool {
        match self {
            FieldId::Founders | FieldId::Capital | FieldId::Head | FieldId::BranchesCount => {
                entity_type == EntityType::Company
            }
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldId::RegistrationNumber => "registration_number",
            FieldId::Inn => "inn",
            FieldId::FullName => "full_name",
            FieldId::ShortName => "short_name",
            FieldId::RegisteredOn => "registered_on",
            FieldId::Status => "status",
            FieldId::Address => "address",
            FieldId::MainActivity => "main_activity",
            FieldId::AdditionalActivities => "additional_activities",
            FieldId::Founders => "founders",
            FieldId::Capital => "capital",
            FieldId::Head => "head",
            FieldId::LicensesCount => "licenses_count",
            FieldId::BranchesCount => "branches_count",
        }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a change event.
///
/// Declaration order is the order in which events of one comparison are
/// emitted and receive sequence keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    /// Entity seen for the first time (opt-in, never produced by a diff)
    FirstObserved,
    Identity,
    Status,
    Address,
    Activity,
    Founders,
    Capital,
    Head,
    Licenses,
    Branches,
    /// All deltas of one comparison in a single event
    Composite,
}

impl ChangeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeCategory::FirstObserved => "first_observed",
            ChangeCategory::Identity => "identity",
            ChangeCategory::Status => "status",
            ChangeCategory::Address => "address",
            ChangeCategory::Activity => "activity",
            ChangeCategory::Founders => "founders",
            ChangeCategory::Capital => "capital",
            ChangeCategory::Head => "head",
            ChangeCategory::Licenses => "licenses",
            ChangeCategory::Branches => "branches",
            ChangeCategory::Composite => "composite",
        }
    }
}

impl fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let category = match s {
            "first_observed" => ChangeCategory::FirstObserved,
            "identity" => ChangeCategory::Identity,
            "status" => ChangeCategory::Status,
            "address" => ChangeCategory::Address,
            "activity" => ChangeCategory::Activity,
            "founders" => ChangeCategory::Founders,
            "capital" => ChangeCategory::Capital,
            "head" => ChangeCategory::Head,
            "licenses" => ChangeCategory::Licenses,
            "branches" => ChangeCategory::Branches,
            "composite" => ChangeCategory::Composite,
            other => return Err(format!("unknown change category '{}'", other)),
        };
        Ok(category)
    }
}

/// Value carried by a delta; the variant depends on the field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Date(NaiveDate),
    Count(u32),
    Address(Address),
    Activity(ActivityCode),
    Founder(Founder),
    Person(Person),
    Capital(Capital),
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(v: NaiveDate) -> Self {
        FieldValue::Date(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Count(v)
    }
}

impl From<Address> for FieldValue {
    fn from(v: Address) -> Self {
        FieldValue::Address(v)
    }
}

impl From<ActivityCode> for FieldValue {
    fn from(v: ActivityCode) -> Self {
        FieldValue::Activity(v)
    }
}

impl From<Founder> for FieldValue {
    fn from(v: Founder) -> Self {
        FieldValue::Founder(v)
    }
}

impl From<Person> for FieldValue {
    fn from(v: Person) -> Self {
        FieldValue::Person(v)
    }
}

impl From<Capital> for FieldValue {
    fn from(v: Capital) -> Self {
        FieldValue::Capital(v)
    }
}

/// Kind of a field-level change.
///
/// `Added` and `Removed` apply to elements of set-valued fields (and to the
/// registration number of a first-observed event); scalar and optional fields
/// only ever produce `Modified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Added,
    Removed,
    Modified,
}

/// A single difference between two normalized snapshots
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDelta {
    pub field: FieldId,
    /// Element identity inside a set-valued field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub kind: DeltaKind,
    #[serde(default)]
    pub previous: Option<FieldValue>,
    #[serde(default)]
    pub current: Option<FieldValue>,
}

impl FieldDelta {
    pub fn modified(field: FieldId, previous: Option<FieldValue>, current: Option<FieldValue>) -> Self {
        Self {
            field,
            key: None,
            kind: DeltaKind::Modified,
            previous,
            current,
        }
    }

    pub fn added(field: FieldId, key: impl Into<String>, current: FieldValue) -> Self {
        Self {
            field,
            key: Some(key.into()),
            kind: DeltaKind::Added,
            previous: None,
            current: Some(current),
        }
    }

    pub fn removed(field: FieldId, key: impl Into<String>, previous: FieldValue) -> Self {
        Self {
            field,
            key: Some(key.into()),
            kind: DeltaKind::Removed,
            previous: Some(previous),
            current: None,
        }
    }

    pub fn category(&self) -> ChangeCategory {
        self.field.category()
    }

    /// A delta that carries no value on either side says nothing
    pub fn is_empty(&self) -> bool {
        self.previous.is_none() && self.current.is_none()
    }
}

/// Durable record of one category of change for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub category: ChangeCategory,
    pub deltas: Vec<FieldDelta>,
    pub observed_at: DateTime<Utc>,
    /// Strictly increasing per entity; orders the entity's history
    pub sequence_key: u64,
}

impl ChangeEvent {
    /// Content hash over entity, category and deltas.
    ///
    /// Sequence key and observation time are left out so that the same
    /// comparison presented twice yields the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let content = (&self.entity_type, &self.entity_id, &self.category, &self.deltas);
        let bytes = serde_json::to_vec(&content).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    pub fn fields(&self) -> Vec<FieldId> {
        let mut fields: Vec<FieldId> = self.deltas.iter().map(|d| d.field).collect();
        fields.dedup();
        fields
    }
}

/// Tracking lifecycle of one entity across cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// No snapshot stored yet
    Unknown,
    /// Snapshot stored, no event emitted yet
    Baselined,
    /// At least one change event emitted
    Observed,
}

impl EntityState {
    /// Derive the state from the last sequence key stored with the snapshot
    pub fn from_last_sequence(last_sequence: Option<u64>) -> Self {
        match last_sequence {
            None => EntityState::Unknown,
            Some(0) => EntityState::Baselined,
            Some(_) => EntityState::Observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(sequence_key: u64) -> ChangeEvent {
        ChangeEvent {
            entity_type: EntityType::Company,
            entity_id: EntityId::from("1027700132195"),
            category: ChangeCategory::Status,
            deltas: vec![FieldDelta::modified(
                FieldId::Status,
                Some(FieldValue::Text("active".to_string())),
                Some(FieldValue::Text("liquidating".to_string())),
            )],
            observed_at: Utc::now(),
            sequence_key,
        }
    }

    #[test]
    fn test_fingerprint_ignores_sequence_and_time() {
        let a = status_event(1);
        let mut b = status_event(7);
        b.observed_at = a.observed_at + chrono::Duration::hours(1);

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_deltas() {
        let a = status_event(1);
        let mut b = status_event(1);
        b.deltas[0].current = Some(FieldValue::Text("liquidated".to_string()));

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_category_order_matches_emission_order() {
        let mut categories: Vec<ChangeCategory> =
            FieldId::TRACKED.iter().map(FieldId::category).collect();
        let walked = categories.clone();
        categories.sort();

        assert_eq!(categories, walked);
        assert!(ChangeCategory::FirstObserved < ChangeCategory::Identity);
        assert!(ChangeCategory::Branches < ChangeCategory::Composite);
    }

    #[test]
    fn test_company_only_fields() {
        assert!(FieldId::Founders.applies_to(EntityType::Company));
        assert!(!FieldId::Founders.applies_to(EntityType::Entrepreneur));
        assert!(!FieldId::BranchesCount.applies_to(EntityType::Entrepreneur));
        assert!(FieldId::LicensesCount.applies_to(EntityType::Entrepreneur));
        assert!(FieldId::AdditionalActivities.applies_to(EntityType::Entrepreneur));
    }

    #[test]
    fn test_entity_state_from_last_sequence() {
        assert_eq!(EntityState::from_last_sequence(None), EntityState::Unknown);
        assert_eq!(EntityState::from_last_sequence(Some(0)), EntityState::Baselined);
        assert_eq!(EntityState::from_last_sequence(Some(4)), EntityState::Observed);
    }

    #[test]
    fn test_delta_serializes_tagged_values() {
        let delta = FieldDelta::added(
            FieldId::AdditionalActivities,
            "62.01",
            FieldValue::Activity(ActivityCode::new("62.01")),
        );
        let json = serde_json::to_value(&delta).unwrap();

        assert_eq!(json["field"], "additional_activities");
        assert_eq!(json["kind"], "added");
        assert_eq!(json["current"]["type"], "activity");
        assert_eq!(json["current"]["value"]["code"], "62.01");
        assert!(json["previous"].is_null());
    }
}
