//! Requester-side record of held lock grants.
//!
//! Each simulation tracks which remote MPOs have granted it a read or
//! write during the current cycle, along with the timestamp carried by the
//! grant. The cycle-complete sweep issues exactly one release per entry,
//! so the tracker coalesces the reentrant cases: a write grant supersedes
//! a read grant on the same MPO, and a read grant while the write is held
//! records nothing new.

use std::collections::BTreeMap;

use simmesh_ident::{Mpo, TimeStamp};

/// Read and write grants held by one simulation during the current cycle.
#[derive(Debug, Default)]
pub struct LockTracker {
    reads: BTreeMap<Mpo, TimeStamp>,
    writes: BTreeMap<Mpo, TimeStamp>,
}

impl LockTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read grant from `mpo` at `stamp`.
    ///
    /// A no-op while the write lock on the same MPO is held; the single
    /// release of the write retires both grants.
    pub fn on_read(&mut self, mpo: Mpo, stamp: TimeStamp) {
        if !self.writes.contains_key(&mpo) {
            self.reads.insert(mpo, stamp);
        }
    }

    /// Record a write grant from `mpo` at `stamp`, superseding any read
    /// grant on the same MPO.
    pub fn on_write(&mut self, mpo: Mpo, stamp: TimeStamp) {
        self.reads.remove(&mpo);
        self.writes.insert(mpo, stamp);
    }

    /// Whether a read grant from `mpo` is held (directly or via the write).
    pub fn is_read(&self, mpo: Mpo) -> bool {
        self.reads.contains_key(&mpo) || self.writes.contains_key(&mpo)
    }

    /// Whether the write grant from `mpo` is held.
    pub fn is_write(&self, mpo: Mpo) -> bool {
        self.writes.contains_key(&mpo)
    }

    /// The timestamp carried by the grant from `mpo`, if any.
    pub fn stamp_of(&self, mpo: Mpo) -> Option<TimeStamp> {
        self.writes
            .get(&mpo)
            .or_else(|| self.reads.get(&mpo))
            .copied()
    }

    /// Held read grants, ascending by MPO.
    pub fn reads(&self) -> impl Iterator<Item = (Mpo, TimeStamp)> + '_ {
        self.reads.iter().map(|(mpo, stamp)| (*mpo, *stamp))
    }

    /// Held write grants, ascending by MPO.
    pub fn writes(&self) -> impl Iterator<Item = (Mpo, TimeStamp)> + '_ {
        self.writes.iter().map(|(mpo, stamp)| (*mpo, *stamp))
    }

    /// Whether no grant is held.
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Forget every grant. Called after the release sweep.
    pub fn reset(&mut self) {
        self.reads.clear();
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simmesh_ident::{MachineId, OwnerId, ProcessId};

    fn mpo(o: u16) -> Mpo {
        Mpo::new(MachineId::new(0), ProcessId::new(0), OwnerId::new(o))
    }

    #[test]
    fn write_supersedes_read() {
        let mut tracker = LockTracker::new();
        tracker.on_read(mpo(1), TimeStamp::new(3));
        tracker.on_write(mpo(1), TimeStamp::new(4));
        assert_eq!(tracker.reads().count(), 0);
        assert_eq!(tracker.writes().count(), 1);
        assert!(tracker.is_write(mpo(1)));
        assert_eq!(tracker.stamp_of(mpo(1)), Some(TimeStamp::new(4)));
    }

    #[test]
    fn reentrant_read_under_write_records_nothing() {
        let mut tracker = LockTracker::new();
        tracker.on_write(mpo(1), TimeStamp::new(2));
        tracker.on_read(mpo(1), TimeStamp::new(2));
        assert_eq!(tracker.reads().count(), 0);
        assert!(tracker.is_read(mpo(1)));
    }

    #[test]
    fn grants_sort_by_mpo() {
        let mut tracker = LockTracker::new();
        tracker.on_read(mpo(5), TimeStamp::new(1));
        tracker.on_read(mpo(2), TimeStamp::new(1));
        let order: Vec<Mpo> = tracker.reads().map(|(mpo, _)| mpo).collect();
        assert_eq!(order, vec![mpo(2), mpo(5)]);
    }

    #[test]
    fn reset_empties_the_tracker() {
        let mut tracker = LockTracker::new();
        tracker.on_read(mpo(1), TimeStamp::new(1));
        tracker.on_write(mpo(2), TimeStamp::new(1));
        assert!(!tracker.is_empty());
        tracker.reset();
        assert!(tracker.is_empty());
        assert_eq!(tracker.stamp_of(mpo(2)), None);
    }
}
