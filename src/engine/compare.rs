//! Field comparators
//!
//! Pure functions deciding whether one semantic field differs between two
//! normalized snapshots. Values are compared exactly: no case folding, no
//! numeric tolerance.

use crate::models::{ActivityCode, FieldDelta, FieldId, FieldValue, Founder};
use std::collections::BTreeMap;

/// Element of a set-valued field (activity codes, founders)
pub trait SetElement: Clone + PartialEq + Into<FieldValue> {
    /// Identity that survives attribute changes of the element
    fn identity_key(&self) -> String;
}

impl SetElement for ActivityCode {
    fn identity_key(&self) -> String {
        self.code.clone()
    }
}

impl SetElement for Founder {
    fn identity_key(&self) -> String {
        Founder::identity_key(self)
    }
}

/// Compare two always-present values
pub fn compare_scalar<T>(field: FieldId, previous: &T, current: &T) -> Option<FieldDelta>
where
    T: Clone + PartialEq + Into<FieldValue>,
{
    if previous == current {
        return None;
    }
    Some(FieldDelta::modified(
        field,
        Some(previous.clone().into()),
        Some(current.clone().into()),
    ))
}

/// Compare two optional values; appearance and disappearance are both
/// `modified` at the field level.
pub fn compare_optional<T>(
    field: FieldId,
    previous: Option<&T>,
    current: Option<&T>,
) -> Option<FieldDelta>
where
    T: Clone + PartialEq + Into<FieldValue>,
{
    match (previous, current) {
        (None, None) => None,
        (Some(p), Some(c)) => compare_scalar(field, p, c),
        (p, c) => Some(FieldDelta::modified(
            field,
            p.cloned().map(Into::into),
            c.cloned().map(Into::into),
        )),
    }
}

/// Symmetric difference of two sets keyed by [`SetElement::identity_key`].
///
/// Output is ordered by identity key. Elements sharing a key with changed
/// attributes come out as one `modified` delta. When several elements share
/// a key, exact matches are paired off first and the rest are paired in
/// order, with a `#n` suffix from the second element of a key on.
pub fn compare_set<T: SetElement>(field: FieldId, previous: &[T], current: &[T]) -> Vec<FieldDelta> {
    let prev_groups = grouped(previous);
    let mut cur_groups = grouped(current);
    let mut deltas = Vec::new();

    for (key, mut prev) in prev_groups {
        let mut cur = cur_groups.remove(&key).unwrap_or_default();
        // unchanged elements
        prev.retain(|p| match cur.iter().position(|c| c == p) {
            Some(i) => {
                cur.remove(i);
                false
            }
            None => true,
        });
        push_unmatched(field, &key, &prev, &cur, &mut deltas);
    }

    for (key, cur) in cur_groups {
        push_unmatched(field, &key, &[], &cur, &mut deltas);
    }

    deltas.sort_by(|a, b| a.key.cmp(&b.key));
    deltas
}

fn grouped<T: SetElement>(items: &[T]) -> BTreeMap<String, Vec<&T>> {
    let mut groups: BTreeMap<String, Vec<&T>> = BTreeMap::new();
    for item in items {
        groups.entry(item.identity_key()).or_default().push(item);
    }
    groups
}

fn push_unmatched<T: SetElement>(
    field: FieldId,
    key: &str,
    previous: &[&T],
    current: &[&T],
    deltas: &mut Vec<FieldDelta>,
) {
    for i in 0..previous.len().max(current.len()) {
        let key = if i == 0 { key.to_string() } else { format!("{}#{}", key, i + 1) };
        match (previous.get(i), current.get(i)) {
            (Some(p), Some(c)) => deltas.push(FieldDelta {
                key: Some(key),
                ..FieldDelta::modified(field, Some((**p).clone().into()), Some((**c).clone().into()))
            }),
            (Some(p), None) => deltas.push(FieldDelta::removed(field, key, (**p).clone().into())),
            (None, Some(c)) => deltas.push(FieldDelta::added(field, key, (**c).clone().into())),
            (None, None) => {}
        }
    }
}
