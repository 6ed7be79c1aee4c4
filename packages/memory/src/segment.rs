//! Named shared segments.
//!
//! Every simulation owns one segment holding the shared part of each of
//! its objects. A segment is addressed by name; the [`SegmentRegistry`]
//! maps names to live segments the way an OS maps shared-memory names to
//! mappings, and [`SegmentAccess`] resolves which name a given simulation
//! uses. Object payloads sit behind a [`SharedHeader`] carrying the
//! object's network address, its freshness timestamp, and one heap slot
//! per process on the machine.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use simmesh_ident::{Mpo, NetworkAddress, ObjectId, ProcessId, TimeStamp, MAX_PROCESS_PER_MACHINE};

use crate::buf::AlignedBuf;
use crate::error::{MemoryError, Result};

const PROCESS_SLOTS: usize = MAX_PROCESS_PER_MACHINE as usize;

/// Key into one process's private heap arena.
///
/// Stored in [`SharedHeader`] slots so a process can find the heap
/// extension of a shared object without a table lookup by reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapKey(u64);

impl HeapKey {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HeapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Header preceding every shared object payload.
#[derive(Debug, Clone)]
pub struct SharedHeader {
    network_address: NetworkAddress,
    timestamp: TimeStamp,
    heap_slots: [Option<HeapKey>; PROCESS_SLOTS],
}

impl SharedHeader {
    /// Header for a freshly constructed object. The timestamp starts at
    /// zero, before the first simulation cycle.
    pub fn new(network_address: NetworkAddress) -> Self {
        Self {
            network_address,
            timestamp: TimeStamp::new(0),
            heap_slots: [None; PROCESS_SLOTS],
        }
    }

    pub fn network_address(&self) -> NetworkAddress {
        self.network_address
    }

    /// Cycle at which the payload was last written.
    pub fn timestamp(&self) -> TimeStamp {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: TimeStamp) {
        self.timestamp = timestamp;
    }

    pub fn heap_slot(&self, process: ProcessId) -> Option<HeapKey> {
        self.heap_slots[slot_index(process)]
    }

    pub fn set_heap_slot(&mut self, process: ProcessId, key: HeapKey) {
        self.heap_slots[slot_index(process)] = Some(key);
    }

    pub fn clear_heap_slot(&mut self, process: ProcessId) -> Option<HeapKey> {
        self.heap_slots[slot_index(process)].take()
    }
}

fn slot_index(process: ProcessId) -> usize {
    debug_assert!((process.value() as usize) < PROCESS_SLOTS);
    process.value() as usize
}

struct SharedObject {
    header: SharedHeader,
    data: AlignedBuf,
}

/// A named slab of shared objects belonging to one simulation.
pub struct Segment {
    name: String,
    objects: HashMap<ObjectId, SharedObject>,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        self.objects.contains_key(&object)
    }

    pub fn insert(&mut self, object: ObjectId, header: SharedHeader, data: AlignedBuf) {
        debug_assert!(!self.objects.contains_key(&object));
        self.objects.insert(object, SharedObject { header, data });
    }

    pub fn remove(&mut self, object: ObjectId) -> Option<(SharedHeader, AlignedBuf)> {
        self.objects
            .remove(&object)
            .map(|entry| (entry.header, entry.data))
    }

    pub fn header(&self, object: ObjectId) -> Option<&SharedHeader> {
        self.objects.get(&object).map(|entry| &entry.header)
    }

    pub fn header_mut(&mut self, object: ObjectId) -> Option<&mut SharedHeader> {
        self.objects.get_mut(&object).map(|entry| &mut entry.header)
    }

    pub fn bytes(&self, object: ObjectId) -> Option<&[u8]> {
        self.objects.get(&object).map(|entry| entry.data.as_slice())
    }

    /// Header and payload under one mutable borrow, for writes that must
    /// also stamp the header.
    pub fn parts_mut(&mut self, object: ObjectId) -> Option<(&mut SharedHeader, &mut [u8])> {
        self.objects
            .get_mut(&object)
            .map(|entry| (&mut entry.header, entry.data.as_mut_slice()))
    }

    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("objects", &self.objects.len())
            .finish()
    }
}

/// Shared handle to one segment.
pub type SegmentHandle = Arc<Mutex<Segment>>;

/// Lock a segment handle, surfacing poisoning as an error.
pub fn lock_segment(handle: &SegmentHandle) -> Result<MutexGuard<'_, Segment>> {
    handle
        .lock()
        .map_err(|poisoned| MemoryError::SegmentPoisoned(poisoned.into_inner().name().to_string()))
}

/// Process-wide table of live segments by name.
///
/// Cloning the registry clones the handle; all clones see the same
/// segments.
#[derive(Clone, Default)]
pub struct SegmentRegistry {
    segments: Arc<Mutex<HashMap<String, SegmentHandle>>>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `name`, creating an empty segment if none exists yet.
    pub fn open_or_create(&self, name: &str) -> Result<SegmentHandle> {
        let mut segments = self.lock()?;
        let handle = segments
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Segment::new(name))));
        Ok(handle.clone())
    }

    /// Open an existing segment, failing if it was never created.
    pub fn open(&self, name: &str) -> Result<SegmentHandle> {
        let segments = self.lock()?;
        segments
            .get(name)
            .cloned()
            .ok_or_else(|| MemoryError::SegmentUnavailable(name.to_string()))
    }

    /// Drop `name` from the registry. Outstanding handles stay usable
    /// until released; new opens fail.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut segments = self.lock()?;
        Ok(segments.remove(name).is_some())
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(name))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, SegmentHandle>>> {
        self.segments
            .lock()
            .map_err(|_| MemoryError::SegmentPoisoned("registry".to_string()))
    }
}

impl fmt::Debug for SegmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.lock().map(|segments| segments.len());
        f.debug_struct("SegmentRegistry")
            .field("segments", &count)
            .finish()
    }
}

/// Resolves the segment name a simulation's objects live under.
///
/// Deployments with a daemon route this through it; the leaf asks once
/// per simulation and caches the answer.
pub trait SegmentAccess: Send + Sync {
    fn acquire(&self, mpo: Mpo) -> Result<String>;
}

/// Deterministic per-simulation names for single-machine deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSegmentNames;

impl SegmentAccess for LocalSegmentNames {
    fn acquire(&self, mpo: Mpo) -> Result<String> {
        Ok(format!("simmesh_{mpo}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SizeAlignment;
    use simmesh_ident::{MachineId, OwnerId, ProcessId};

    fn mpo() -> Mpo {
        Mpo::new(MachineId::new(0), ProcessId::new(0), OwnerId::new(3))
    }

    #[test]
    fn registry_reuses_existing_segment() {
        let registry = SegmentRegistry::new();
        let a = registry.open_or_create("seg").unwrap();
        let b = registry.open_or_create("seg").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        assert!(registry.remove("seg").unwrap());
        assert!(!registry.remove("seg").unwrap());
        assert!(matches!(
            registry.open("seg"),
            Err(MemoryError::SegmentUnavailable(_))
        ));
    }

    #[test]
    fn header_slots_track_per_process_keys() {
        let mut header = SharedHeader::new(NetworkAddress::new(9));
        let p0 = ProcessId::new(0);
        let p1 = ProcessId::new(1);

        assert!(header.heap_slot(p0).is_none());
        header.set_heap_slot(p0, HeapKey::new(11));
        header.set_heap_slot(p1, HeapKey::new(12));
        assert_eq!(header.heap_slot(p0), Some(HeapKey::new(11)));
        assert_eq!(header.heap_slot(p1), Some(HeapKey::new(12)));

        assert_eq!(header.clear_heap_slot(p0), Some(HeapKey::new(11)));
        assert!(header.heap_slot(p0).is_none());
        assert_eq!(header.heap_slot(p1), Some(HeapKey::new(12)));
    }

    #[test]
    fn segment_stores_and_stamps_objects() {
        let mut segment = Segment::new(LocalSegmentNames.acquire(mpo()).unwrap());
        let object = ObjectId::new(0);
        let buffer = AlignedBuf::new(SizeAlignment::new(16, 8)).unwrap();
        segment.insert(object, SharedHeader::new(NetworkAddress::new(1)), buffer);

        {
            let (header, bytes) = segment.parts_mut(object).unwrap();
            bytes[0] = 0x5a;
            header.set_timestamp(TimeStamp::new(4));
        }
        assert_eq!(segment.bytes(object).unwrap()[0], 0x5a);
        assert_eq!(segment.header(object).unwrap().timestamp(), TimeStamp::new(4));

        let (header, _data) = segment.remove(object).unwrap();
        assert_eq!(header.network_address(), NetworkAddress::new(1));
        assert!(segment.is_empty());
    }
}
