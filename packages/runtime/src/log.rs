//! Per-simulation event log.
//!
//! A behavior appends scheduling and memory records while its cycle runs;
//! the cycle-complete sweep drains everything appended since the previous
//! sweep and folds it into one [`Transaction`] per write-locked target.
//! Draining advances a cursor - older records are never reprocessed.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use simmesh_ident::{Mpo, Reference};

/// What a scheduling record asks of the receiving simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingAction {
    /// Begin cycling the referenced action object.
    Start,
    /// Stop cycling the referenced action object.
    Stop,
}

/// One scheduling event addressed to the referenced object's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingRecord {
    pub reference: Reference,
    pub action: SchedulingAction,
}

/// One object write, carrying the image as the owner should see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub reference: Reference,
    pub image: Bytes,
}

/// A write-release's outbound effects. The receiver applies everything
/// here before acknowledging the release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub scheduling: Vec<SchedulingRecord>,
    pub memory: Vec<MemoryRecord>,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.scheduling.is_empty() && self.memory.is_empty()
    }
}

/// Append-only tracks of one simulation's cycle events.
#[derive(Debug, Default)]
pub struct EventLog {
    scheduling: Vec<SchedulingRecord>,
    memory: Vec<MemoryRecord>,
    scheduling_cursor: usize,
    memory_cursor: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scheduling(&mut self, reference: Reference, action: SchedulingAction) {
        self.scheduling.push(SchedulingRecord { reference, action });
    }

    pub fn record_memory(&mut self, reference: Reference, image: Bytes) {
        self.memory.push(MemoryRecord { reference, image });
    }

    /// Records appended since the last drain, grouped for transaction
    /// assembly. Records referencing `own` are dropped here: the owner's
    /// state was updated in place and needs no transaction.
    pub fn drain_cycle(&mut self, own: Mpo) -> CycleRecords {
        let mut records = CycleRecords::default();

        for record in &self.scheduling[self.scheduling_cursor..] {
            match record.reference.mpo() {
                Some(mpo) if mpo != own => {
                    records.scheduling.entry(mpo).or_default().push(*record);
                }
                Some(_) => {}
                None => {
                    warn!(reference = %record.reference, "scheduling record without a heap form, dropped");
                }
            }
        }
        self.scheduling_cursor = self.scheduling.len();

        for record in &self.memory[self.memory_cursor..] {
            if record.reference.mpo().is_some_and(|mpo| mpo != own) {
                // last write per reference wins
                records.memory.insert(record.reference, record.clone());
            }
        }
        self.memory_cursor = self.memory.len();

        records
    }

    /// Records appended and not yet drained.
    pub fn pending(&self) -> usize {
        (self.scheduling.len() - self.scheduling_cursor) + (self.memory.len() - self.memory_cursor)
    }
}

/// One cycle's outbound records, keyed for per-target assembly.
#[derive(Debug, Default)]
pub struct CycleRecords {
    scheduling: BTreeMap<Mpo, Vec<SchedulingRecord>>,
    memory: BTreeMap<Reference, MemoryRecord>,
}

impl CycleRecords {
    pub fn is_empty(&self) -> bool {
        self.scheduling.is_empty() && self.memory.is_empty()
    }

    /// Every simulation this cycle produced records for.
    pub fn targets(&self) -> BTreeSet<Mpo> {
        let mut targets: BTreeSet<Mpo> = self.scheduling.keys().copied().collect();
        targets.extend(self.memory.keys().filter_map(|reference| reference.mpo()));
        targets
    }

    /// The transaction carried by the write release sent to `target`.
    pub fn transaction_for(&self, target: Mpo) -> Transaction {
        let scheduling = self.scheduling.get(&target).cloned().unwrap_or_default();
        let memory = self
            .memory
            .range(Reference::mpo_floor(target)..)
            .take_while(|(reference, _)| reference.mpo() == Some(target))
            .map(|(_, record)| record.clone())
            .collect();
        Transaction { scheduling, memory }
    }
}
