//! Fixed-capacity slot allocator with free-list reuse.
//!
//! Every identity level of the mesh (machine, process, owner) draws its
//! indices from one of these. Freed slots are pushed to the front of the
//! free list, so the most recently freed index is the first one reused.

use std::collections::VecDeque;

use crate::error::{IdentError, Result};

/// Allocator handing out slot indices `0..capacity` with reuse.
#[derive(Debug, Clone)]
pub struct RingAllocator {
    free: VecDeque<u16>,
    capacity: u16,
}

impl RingAllocator {
    /// Create an allocator with all `capacity` slots free.
    pub fn new(capacity: u16) -> Self {
        let mut ring = Self {
            free: VecDeque::with_capacity(capacity as usize),
            capacity,
        };
        ring.reset();
        ring
    }

    /// Take the next free slot.
    pub fn allocate(&mut self) -> Result<u16> {
        self.free
            .pop_front()
            .ok_or(IdentError::Capacity(self.capacity))
    }

    /// Return a slot to the pool. It becomes the next slot handed out.
    pub fn free(&mut self, slot: u16) {
        debug_assert!(slot < self.capacity, "slot {slot} out of range");
        debug_assert!(!self.free.contains(&slot), "slot {slot} double freed");
        self.free.push_front(slot);
    }

    /// Whether every slot is currently held.
    pub fn full(&self) -> bool {
        self.free.is_empty()
    }

    /// Whether no slot is currently held.
    pub fn empty(&self) -> bool {
        self.free.len() == self.capacity as usize
    }

    /// Release every slot, restoring the initial `0..capacity` order.
    pub fn reset(&mut self) {
        self.free.clear();
        self.free.extend(0..self.capacity);
    }

    /// Total number of slots.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// The currently held slot indices, in ascending order.
    pub fn allocated(&self) -> Vec<u16> {
        (0..self.capacity)
            .filter(|slot| !self.free.contains(slot))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn allocates_in_order_then_reuses_most_recently_freed() {
        let mut ring = RingAllocator::new(3);
        assert_eq!(ring.allocate().unwrap(), 0);
        assert_eq!(ring.allocate().unwrap(), 1);
        ring.free(0);
        assert_eq!(ring.allocate().unwrap(), 0);
        assert_eq!(ring.allocate().unwrap(), 2);
        assert!(matches!(ring.allocate(), Err(IdentError::Capacity(3))));
    }

    #[test]
    fn full_and_empty_track_outstanding_slots() {
        let mut ring = RingAllocator::new(2);
        assert!(ring.empty());
        assert!(!ring.full());
        let a = ring.allocate().unwrap();
        let b = ring.allocate().unwrap();
        assert!(ring.full());
        ring.free(a);
        ring.free(b);
        assert!(ring.empty());
    }

    #[test]
    fn no_two_held_slots_are_equal() {
        let mut ring = RingAllocator::new(8);
        let mut held = BTreeSet::new();
        // Interleave allocations and frees and check uniqueness throughout.
        for round in 0..4 {
            for _ in 0..6 {
                let slot = ring.allocate().unwrap();
                assert!(held.insert(slot), "slot {slot} issued twice");
            }
            for slot in held.iter().skip(round).take(3).copied().collect::<Vec<_>>() {
                ring.free(slot);
                held.remove(&slot);
            }
        }
    }

    #[test]
    fn drain_and_refill_returns_the_same_index_set() {
        let mut ring = RingAllocator::new(5);
        let first: BTreeSet<u16> = (0..5).map(|_| ring.allocate().unwrap()).collect();
        for slot in &first {
            ring.free(*slot);
        }
        let second: BTreeSet<u16> = (0..5).map(|_| ring.allocate().unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn allocated_reports_held_slots_sorted() {
        let mut ring = RingAllocator::new(4);
        assert!(ring.allocated().is_empty());
        ring.allocate().unwrap();
        ring.allocate().unwrap();
        ring.allocate().unwrap();
        ring.free(1);
        assert_eq!(ring.allocated(), vec![0, 2]);
    }

    #[test]
    fn reset_restores_initial_order() {
        let mut ring = RingAllocator::new(3);
        ring.allocate().unwrap();
        ring.allocate().unwrap();
        ring.reset();
        assert_eq!(ring.allocate().unwrap(), 0);
        assert_eq!(ring.allocate().unwrap(), 1);
        assert_eq!(ring.allocate().unwrap(), 2);
    }
}
