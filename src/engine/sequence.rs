//! Per-entity sequence allocator
//!
//! Hands out strictly increasing sequence keys per entity id. Each entity
//! owns its own atomic counter, so allocations for the same id serialize on
//! that counter while different ids never contend beyond the map lookup.
//!
//! The allocator holds no durable state. Counters are seeded from the last
//! sequence value stored alongside each entity's snapshot, so a restart
//! resumes above everything already issued.

use crate::models::EntityId;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct SequenceAllocator {
    counters: RwLock<HashMap<EntityId, Arc<AtomicU64>>>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, entity_id: &EntityId) -> Arc<AtomicU64> {
        {
            let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(counter) = counters.get(entity_id) {
                return Arc::clone(counter);
            }
        }

        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            counters
                .entry(entity_id.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    /// Raise the entity's counter to at least `last_issued`. Never lowers it.
    pub fn seed(&self, entity_id: &EntityId, last_issued: u64) {
        self.counter(entity_id).fetch_max(last_issued, Ordering::SeqCst);
    }

    /// Set the entity's counter back to `last_issued` so the next keys are
    /// handed out again. Only sound while the caller has exclusive use of
    /// the entity and the keys above `last_issued` are either unused or hold
    /// the events that will be re-presented under them.
    pub fn rewind(&self, entity_id: &EntityId, last_issued: u64) {
        self.counter(entity_id).store(last_issued, Ordering::SeqCst);
    }

    /// Reserve `count` consecutive keys for one entity
    pub fn reserve(&self, entity_id: &EntityId, count: u64) -> RangeInclusive<u64> {
        if count == 0 {
            let last = self.last_issued(entity_id);
            // empty range
            return (last + 1)..=last;
        }
        let previous = self.counter(entity_id).fetch_add(count, Ordering::SeqCst);
        (previous + 1)..=(previous + count)
    }

    pub fn next(&self, entity_id: &EntityId) -> u64 {
        *self.reserve(entity_id, 1).start()
    }

    /// Highest key handed out (or seeded) for the entity, 0 if none
    pub fn last_issued(&self, entity_id: &EntityId) -> u64 {
        self.counter(entity_id).load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_keys_start_at_one_and_increase() {
        let allocator = SequenceAllocator::new();
        let id = EntityId::from("1027700132195");

        assert_eq!(allocator.next(&id), 1);
        assert_eq!(allocator.reserve(&id, 3), 2..=4);
        assert_eq!(allocator.last_issued(&id), 4);
    }

    #[test]
    fn test_entities_are_independent() {
        let allocator = SequenceAllocator::new();
        let a = EntityId::from("1027700132195");
        let b = EntityId::from("1027739609391");

        allocator.reserve(&a, 5);
        assert_eq!(allocator.next(&b), 1);
    }

    #[test]
    fn test_seed_never_lowers() {
        let allocator = SequenceAllocator::new();
        let id = EntityId::from("1027700132195");

        allocator.seed(&id, 10);
        assert_eq!(allocator.next(&id), 11);

        allocator.seed(&id, 3);
        assert_eq!(allocator.next(&id), 12);
    }

    #[test]
    fn test_rewind_reissues_keys() {
        let allocator = SequenceAllocator::new();
        let id = EntityId::from("1027700132195");

        allocator.seed(&id, 4);
        assert_eq!(allocator.reserve(&id, 2), 5..=6);

        allocator.rewind(&id, 4);
        assert_eq!(allocator.next(&id), 5);
    }

    #[test]
    fn test_empty_reservation_does_not_advance() {
        let allocator = SequenceAllocator::new();
        let id = EntityId::from("1027700132195");

        assert!(allocator.reserve(&id, 0).is_empty());
        assert_eq!(allocator.next(&id), 1);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let allocator = Arc::new(SequenceAllocator::new());
        let id = EntityId::from("1027700132195");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                let id = id.clone();
                thread::spawn(move || (0..100).map(|_| allocator.next(&id)).collect::<Vec<_>>())
            })
            .collect();

        let mut keys: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        keys.sort_unstable();
        keys.dedup();

        assert_eq!(keys.len(), 800);
        assert_eq!(keys.last(), Some(&800));
    }
}
