//! Priority-weighted fixed-capacity reservoir (§4.3 "Event reservoirs", §8).

use crate::domain_types::{Priority, ReservoirCapacity};

struct Slot<T> {
    priority: Priority,
    seq: u64,
    value: T,
}

/// Fixed-capacity sample of `T`, retaining the highest-priority elements seen.
///
/// Below capacity every insert is kept. At capacity, a new element replaces
/// the current minimum only if its priority is strictly greater; ties are
/// broken in favor of the earlier-inserted element (§8 "priority-preserving
/// eviction").
#[derive(Debug, Clone, Default)]
pub struct Reservoir<T> {
    capacity: usize,
    slots: Vec<Slot<T>>,
    next_seq: u64,
    events_seen: u64,
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .finish()
    }
}

impl<T> Clone for Slot<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            seq: self.seq,
            value: self.value.clone(),
        }
    }
}

impl<T> Reservoir<T> {
    /// Creates an empty reservoir with the given capacity.
    #[must_use]
    pub fn new(capacity: ReservoirCapacity) -> Self {
        Self {
            capacity: capacity.as_usize(),
            slots: Vec::new(),
            next_seq: 0,
            events_seen: 0,
        }
    }

    /// Attempts to insert `value` at `priority`. Returns `true` if it was
    /// retained (stored or replaced an evicted minimum), `false` if dropped.
    pub fn insert(&mut self, priority: Priority, value: T) -> bool {
        self.events_seen += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        if self.slots.len() < self.capacity {
            self.slots.push(Slot { priority, seq, value });
            return true;
        }

        let Some(min_index) = self.min_index() else {
            return false;
        };
        if priority > self.slots[min_index].priority {
            self.slots[min_index] = Slot { priority, seq, value };
            true
        } else {
            false
        }
    }

    /// Merges another reservoir's contents into this one using the same
    /// priority-aware insertion, used to recover data after a failed
    /// harvest delivery (§4.3 "On merge across reservoirs").
    pub fn merge(&mut self, other: Self) {
        self.events_seen += other.events_seen.saturating_sub(other.slots.len() as u64);
        for slot in other.slots {
            self.insert(slot.priority, slot.value);
        }
    }

    /// Returns the index of the slot with lowest priority, breaking ties in
    /// favor of evicting the most-recently-inserted (i.e. the earlier
    /// insertion is preferred to survive).
    fn min_index(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)
    }

    /// Current number of retained elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the reservoir currently holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of insert attempts since creation, including drops —
    /// reported on the wire as `events_seen` (§6).
    #[must_use]
    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    /// Iterates the retained values in no particular order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|s| &s.value)
    }

    /// Consumes the reservoir, returning its retained values.
    pub fn into_values(self) -> Vec<T> {
        self.slots.into_iter().map(|s| s.value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(v: f64) -> Priority {
        Priority::try_new(v).unwrap()
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut r = Reservoir::new(ReservoirCapacity::try_new(3).unwrap());
        for i in 0..20 {
            r.insert(p((i as f64 / 20.0).min(0.999)), i);
        }
        assert!(r.len() <= 3);
    }

    #[test]
    fn retains_top_priorities_on_overflow() {
        let mut r = Reservoir::new(ReservoirCapacity::try_new(3).unwrap());
        for priority in [0.1, 0.9, 0.5, 0.7, 0.2, 0.8] {
            r.insert(p(priority), priority);
        }
        let mut retained: Vec<f64> = r.values().copied().collect();
        retained.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(retained, vec![0.7, 0.8, 0.9]);
    }

    #[test]
    fn below_capacity_everything_is_kept() {
        let mut r = Reservoir::new(ReservoirCapacity::try_new(10).unwrap());
        for i in 0..5 {
            assert!(r.insert(p(i as f64 / 10.0), i));
        }
        assert_eq!(r.len(), 5);
    }

    #[test]
    fn merge_preserves_priority_ordering_across_reservoirs() {
        let mut a = Reservoir::new(ReservoirCapacity::try_new(2).unwrap());
        a.insert(p(0.9), "a-high");
        a.insert(p(0.1), "a-low");

        let mut b = Reservoir::new(ReservoirCapacity::try_new(2).unwrap());
        b.insert(p(0.95), "b-highest");
        b.insert(p(0.05), "b-lowest");

        a.merge(b);
        assert_eq!(a.len(), 2);
        let retained: Vec<_> = a.values().copied().collect();
        assert!(retained.contains(&"a-high"));
        assert!(retained.contains(&"b-highest"));
    }

    proptest::proptest! {
        #[test]
        fn post_insert_size_never_exceeds_capacity(
            cap in 1usize..20,
            priorities in proptest::collection::vec(0.0f64..0.999, 0..100)
        ) {
            let mut r = Reservoir::new(ReservoirCapacity::try_new(cap).unwrap());
            for value in priorities {
                r.insert(p(value), value);
                prop_assert!(r.len() <= cap);
            }
        }
    }
}
