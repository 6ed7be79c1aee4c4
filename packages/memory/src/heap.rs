//! Heap-part memory manager.
//!
//! Every process keeps a private arena of heap extensions, one per object
//! it works with. The extension's key is recorded in the object's shared
//! header under this process's slot, so a second request finds the
//! existing buffer through the header instead of constructing again.
//! Extensions never cross the process boundary; when a simulation goes
//! away, a range sweep over the reference ordering frees every extension
//! under it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use simmesh_ident::{Mpo, ProcessId, Reference};

use crate::buf::AlignedBuf;
use crate::error::{MemoryError, Result};
use crate::provider::{CodeProvider, FnCache};
use crate::segment::{HeapKey, SharedHeader};
use crate::shared::heap_part;

/// Manager of this process's heap extensions.
pub struct HeapMemoryManager {
    process: ProcessId,
    functions: FnCache,
    next_key: u64,
    buffers: HashMap<HeapKey, AlignedBuf>,
    /// Extension keys by reference, ordered so sweeps group by MPO.
    by_ref: BTreeMap<Reference, HeapKey>,
}

impl HeapMemoryManager {
    pub fn new(process: ProcessId, provider: Arc<dyn CodeProvider>) -> Self {
        Self {
            process,
            functions: FnCache::new(provider),
            next_key: 0,
            buffers: HashMap::new(),
            by_ref: BTreeMap::new(),
        }
    }

    /// The process whose header slot this manager fills.
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Allocate this process's heap extension for `reference`, recording
    /// the key in the object's header. An already-filled slot short
    /// circuits; nothing is constructed twice.
    pub fn ensure_allocated(
        &mut self,
        reference: &Reference,
        header: &mut SharedHeader,
    ) -> Result<HeapKey> {
        heap_part(reference)?;
        if let Some(key) = header.heap_slot(self.process) {
            return Ok(key);
        }
        let functions = self.functions.get(reference.type_id())?;
        let mut data = AlignedBuf::new(functions.heap)?;
        (functions.heap_ctor)(data.as_mut_slice());
        let key = HeapKey::new(self.next_key);
        self.next_key += 1;
        self.buffers.insert(key, data);
        self.by_ref.insert(*reference, key);
        header.set_heap_slot(self.process, key);
        debug!(%reference, %key, "allocated heap extension");
        Ok(key)
    }

    /// The extension bytes for `key`.
    pub fn bytes(&self, key: HeapKey) -> Option<&[u8]> {
        self.buffers.get(&key).map(AlignedBuf::as_slice)
    }

    pub fn bytes_mut(&mut self, key: HeapKey) -> Option<&mut [u8]> {
        self.buffers.get_mut(&key).map(AlignedBuf::as_mut_slice)
    }

    /// The extension key for `reference`, when one was allocated here.
    pub fn key_of(&self, reference: &Reference) -> Option<HeapKey> {
        self.by_ref.get(reference).copied()
    }

    /// Free the extension for `reference` and clear its header slot.
    pub fn free(&mut self, reference: &Reference, header: &mut SharedHeader) -> Result<()> {
        let key = self
            .by_ref
            .remove(reference)
            .ok_or(MemoryError::UnknownObject(*reference))?;
        self.destroy_buffer(reference, key)?;
        header.clear_heap_slot(self.process);
        Ok(())
    }

    /// Free every extension under `mpo`. Header slots are left alone; the
    /// shared objects are torn down with them. Returns how many
    /// extensions were freed.
    pub fn free_all(&mut self, mpo: Mpo) -> Result<usize> {
        let owned: Vec<(Reference, HeapKey)> = self
            .by_ref
            .range(Reference::mpo_floor(mpo)..)
            .take_while(|(r, _)| r.mpo() == Some(mpo))
            .map(|(r, k)| (*r, *k))
            .collect();
        for (reference, key) in &owned {
            self.by_ref.remove(reference);
            self.destroy_buffer(reference, *key)?;
        }
        if !owned.is_empty() {
            debug!(%mpo, count = owned.len(), "released heap extensions");
        }
        Ok(owned.len())
    }

    fn destroy_buffer(&mut self, reference: &Reference, key: HeapKey) -> Result<()> {
        let functions = self.functions.get(reference.type_id())?;
        let mut data = self
            .buffers
            .remove(&key)
            .ok_or(MemoryError::UnknownObject(*reference))?;
        (functions.heap_dtor)(data.as_mut_slice());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl std::fmt::Debug for HeapMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapMemoryManager")
            .field("process", &self.process)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FixedProvider;
    use simmesh_ident::{
        MachineId, NetworkAddress, ObjectId, OwnerId, TimeStamp, TypeId, TypeInstance,
    };
    use std::sync::atomic::Ordering;

    fn mpo(owner: u16) -> Mpo {
        Mpo::new(MachineId::new(0), ProcessId::new(0), OwnerId::new(owner))
    }

    fn reference(owner: u16, object: u16) -> Reference {
        Reference::heap(
            TypeInstance::object(TypeId::new(1)),
            mpo(owner),
            ObjectId::new(object),
            TimeStamp::new(0),
        )
    }

    #[test]
    fn ensure_allocates_at_most_once() {
        let provider = FixedProvider::default();
        let counters = provider.counters();
        let mut heap = HeapMemoryManager::new(ProcessId::new(0), Arc::new(provider));
        let mut header = SharedHeader::new(NetworkAddress::new(1));
        let r = reference(1, 0);

        let first = heap.ensure_allocated(&r, &mut header).unwrap();
        let second = heap.ensure_allocated(&r, &mut header).unwrap();
        assert_eq!(first, second);
        assert_eq!(counters.heap_ctor.load(Ordering::SeqCst), 1);
        assert_eq!(header.heap_slot(ProcessId::new(0)), Some(first));
        assert!(heap.bytes(first).is_some());
    }

    #[test]
    fn processes_get_independent_extensions() {
        let provider = Arc::new(FixedProvider::default());
        let mut p0 = HeapMemoryManager::new(ProcessId::new(0), provider.clone());
        let mut p1 = HeapMemoryManager::new(ProcessId::new(1), provider);
        let mut header = SharedHeader::new(NetworkAddress::new(1));
        let r = reference(1, 0);

        let k0 = p0.ensure_allocated(&r, &mut header).unwrap();
        let k1 = p1.ensure_allocated(&r, &mut header).unwrap();
        assert_eq!(header.heap_slot(ProcessId::new(0)), Some(k0));
        assert_eq!(header.heap_slot(ProcessId::new(1)), Some(k1));

        p0.bytes_mut(k0).unwrap()[0] = 7;
        assert_eq!(p1.bytes(k1).unwrap()[0], 0);
    }

    #[test]
    fn free_clears_the_header_slot() {
        let provider = FixedProvider::default();
        let counters = provider.counters();
        let mut heap = HeapMemoryManager::new(ProcessId::new(2), Arc::new(provider));
        let mut header = SharedHeader::new(NetworkAddress::new(1));
        let r = reference(1, 0);

        heap.ensure_allocated(&r, &mut header).unwrap();
        heap.free(&r, &mut header).unwrap();
        assert!(header.heap_slot(ProcessId::new(2)).is_none());
        assert_eq!(counters.heap_live(), 0);
        assert!(matches!(
            heap.free(&r, &mut header),
            Err(MemoryError::UnknownObject(_))
        ));
    }

    #[test]
    fn free_all_sweeps_one_simulation_only() {
        let provider = FixedProvider::default();
        let counters = provider.counters();
        let mut heap = HeapMemoryManager::new(ProcessId::new(0), Arc::new(provider));

        for object in 0..3 {
            let mut header = SharedHeader::new(NetworkAddress::new(object as u64 + 1));
            heap.ensure_allocated(&reference(1, object), &mut header)
                .unwrap();
        }
        let mut header = SharedHeader::new(NetworkAddress::new(9));
        heap.ensure_allocated(&reference(2, 0), &mut header).unwrap();

        assert_eq!(heap.free_all(mpo(1)).unwrap(), 3);
        assert_eq!(heap.len(), 1);
        assert!(heap.key_of(&reference(2, 0)).is_some());
        assert_eq!(counters.heap_live(), 1);
        assert_eq!(heap.free_all(mpo(1)).unwrap(), 0);
    }
}
