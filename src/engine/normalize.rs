//! Snapshot normalizer
//!
//! Brings a raw snapshot into canonical form before diffing:
//! - whitespace in free text is trimmed and collapsed
//! - empty strings and empty sub-structures become absent
//! - set-valued fields are sorted by identity key and deduplicated
//! - company-only fields are cleared on entrepreneur snapshots
//!
//! The transform is pure and idempotent.

use crate::models::{
    ActivityCode, Address, Capital, EntityId, EntitySnapshot, EntityType, Founder, Person,
};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Snapshot in canonical form. Only [`normalize`] constructs one; a stored
/// snapshot is re-normalized on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EntitySnapshot", into = "EntitySnapshot")]
pub struct NormalizedSnapshot(EntitySnapshot);

impl NormalizedSnapshot {
    pub fn entity_id(&self) -> EntityId {
        self.0.entity_id()
    }

    pub fn into_inner(self) -> EntitySnapshot {
        self.0
    }
}

impl Deref for NormalizedSnapshot {
    type Target = EntitySnapshot;

    fn deref(&self) -> &EntitySnapshot {
        &self.0
    }
}

impl From<EntitySnapshot> for NormalizedSnapshot {
    fn from(raw: EntitySnapshot) -> Self {
        normalize(&raw)
    }
}

impl From<NormalizedSnapshot> for EntitySnapshot {
    fn from(n: NormalizedSnapshot) -> Self {
        n.0
    }
}

/// Canonicalize a raw snapshot
pub fn normalize(raw: &EntitySnapshot) -> NormalizedSnapshot {
    let is_company = raw.entity_type == EntityType::Company;

    let mut additional_activities: Vec<ActivityCode> = raw
        .additional_activities
        .iter()
        .filter_map(normalize_activity)
        .collect();
    additional_activities.sort();
    additional_activities.dedup();

    let founders = if is_company {
        let mut founders: Vec<Founder> = raw.founders.iter().map(normalize_founder).collect();
        founders.sort_by(|a, b| a.identity_key().cmp(&b.identity_key()).then_with(|| a.cmp(b)));
        founders.dedup();
        founders
    } else {
        Vec::new()
    };

    NormalizedSnapshot(EntitySnapshot {
        entity_type: raw.entity_type,
        registration_number: raw.registration_number.trim().to_string(),
        inn: clean_opt(raw.inn.as_deref()),
        full_name: clean_opt(raw.full_name.as_deref()),
        short_name: clean_opt(raw.short_name.as_deref()),
        registered_on: raw.registered_on,
        status: clean_opt(raw.status.as_deref()),
        address: raw.address.as_ref().and_then(normalize_address),
        main_activity: raw.main_activity.as_ref().and_then(normalize_activity),
        additional_activities,
        founders,
        head: if is_company {
            raw.head.as_ref().and_then(normalize_person)
        } else {
            None
        },
        capital: if is_company {
            raw.capital.as_ref().map(normalize_capital)
        } else {
            None
        },
        licenses_count: raw.licenses_count,
        branches_count: if is_company { raw.branches_count } else { None },
    })
}

/// Trim and collapse inner whitespace runs to a single space
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_opt(s: Option<&str>) -> Option<String> {
    s.map(collapse_whitespace).filter(|s| !s.is_empty())
}

fn normalize_address(a: &Address) -> Option<Address> {
    let address = Address {
        postal_code: clean_opt(a.postal_code.as_deref()),
        region: clean_opt(a.region.as_deref()),
        city: clean_opt(a.city.as_deref()),
        street: clean_opt(a.street.as_deref()),
        house: clean_opt(a.house.as_deref()),
        flat: clean_opt(a.flat.as_deref()),
    };
    (!address.is_empty()).then_some(address)
}

fn normalize_activity(a: &ActivityCode) -> Option<ActivityCode> {
    let code = collapse_whitespace(&a.code);
    if code.is_empty() {
        return None;
    }
    Some(ActivityCode {
        code,
        name: clean_opt(a.name.as_deref()),
    })
}

fn normalize_founder(f: &Founder) -> Founder {
    Founder {
        inn: clean_opt(f.inn.as_deref()),
        name: collapse_whitespace(&f.name),
        share_nominal: f.share_nominal,
        share_basis_points: f.share_basis_points,
    }
}

fn normalize_person(p: &Person) -> Option<Person> {
    let person = Person {
        inn: clean_opt(p.inn.as_deref()),
        full_name: collapse_whitespace(&p.full_name),
        position: clean_opt(p.position.as_deref()),
    };
    if person.full_name.is_empty() && person.inn.is_none() {
        return None;
    }
    Some(person)
}

fn normalize_capital(c: &Capital) -> Capital {
    Capital {
        amount: c.amount,
        currency: collapse_whitespace(&c.currency),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn text() -> impl Strategy<Value = String> {
        "[ a-zA-Z0-9.\t]{0,12}"
    }

    fn activity() -> impl Strategy<Value = ActivityCode> {
        ("[ 0-9.]{0,6}", proptest::option::of(text()))
            .prop_map(|(code, name)| ActivityCode { code, name })
    }

    fn founder() -> impl Strategy<Value = Founder> {
        (
            proptest::option::of("[0-9 ]{0,12}"),
            text(),
            proptest::option::of(0i64..1_000_000),
            proptest::option::of(0u32..10_000),
        )
            .prop_map(|(inn, name, share_nominal, share_basis_points)| Founder {
                inn,
                name,
                share_nominal,
                share_basis_points,
            })
    }

    fn snapshot() -> impl Strategy<Value = EntitySnapshot> {
        (
            prop_oneof![Just(EntityType::Company), Just(EntityType::Entrepreneur)],
            proptest::option::of(text()),
            proptest::option::of(text()),
            proptest::option::of((text(), text())),
            prop::collection::vec(activity(), 0..6),
            prop::collection::vec(founder(), 0..5),
            proptest::option::of(0u32..5),
        )
            .prop_map(|(entity_type, full_name, status, addr, activities, founders, licenses)| {
                let mut s = EntitySnapshot::new(entity_type, "1027700132195");
                s.full_name = full_name;
                s.status = status;
                s.address = addr.map(|(city, street)| Address {
                    city: Some(city),
                    street: Some(street),
                    ..Address::default()
                });
                s.additional_activities = activities;
                s.founders = founders;
                s.licenses_count = licenses;
                s
            })
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(raw in snapshot()) {
            let once = normalize(&raw);
            let twice = normalize(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn normalize_ignores_set_order(raw in snapshot()) {
            let mut shuffled = raw.clone();
            shuffled.additional_activities.reverse();
            shuffled.founders.reverse();
            prop_assert_eq!(normalize(&raw), normalize(&shuffled));
        }
    }
}
