//! Simulation memory lifetime.
//!
//! [`LeafMemory`] gathers one process's two managers and its live set
//! under a single lock; every simulation hosted by the process, and the
//! process's own bookkeeping, go through the same [`LeafMemoryHandle`].
//!
//! [`MpoLifetime`] is the scope guard a simulation host holds while it
//! runs: construction registers the MPO as live and builds its root
//! object, drop tears down everything the MPO owns and unregisters it.
//! A failure partway through construction leaves nothing behind.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, error, warn};

use simmesh_ident::{
    ConversationId, HeapRef, Mpo, NetworkAddress, NetworkRef, ProcessId, Reference, TimeStamp,
    TypeInstance, ROOT_TYPE_ID,
};

use crate::error::{MemoryError, Result};
use crate::heap::HeapMemoryManager;
use crate::provider::CodeProvider;
use crate::segment::{lock_segment, HeapKey, SegmentAccess, SegmentRegistry};
use crate::shared::{heap_part, SharedMemoryManager};

/// One process's object memory: shared parts, heap extensions, and the
/// set of simulations live here.
pub struct LeafMemory {
    process: ProcessId,
    shared: SharedMemoryManager,
    heap: HeapMemoryManager,
    live: BTreeSet<Mpo>,
}

/// Shared handle to one process's memory.
pub type LeafMemoryHandle = Arc<Mutex<LeafMemory>>;

/// Lock a leaf memory handle, surfacing poisoning as an error.
pub fn lock_memory(handle: &LeafMemoryHandle) -> Result<MutexGuard<'_, LeafMemory>> {
    handle.lock().map_err(|_| MemoryError::LeafPoisoned)
}

impl LeafMemory {
    pub fn new(
        process: ProcessId,
        registry: SegmentRegistry,
        access: Arc<dyn SegmentAccess>,
        provider: Arc<dyn CodeProvider>,
    ) -> Self {
        Self {
            process,
            shared: SharedMemoryManager::new(registry, access, provider.clone()),
            heap: HeapMemoryManager::new(process, provider),
            live: BTreeSet::new(),
        }
    }

    pub fn into_handle(self) -> LeafMemoryHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn is_live(&self, mpo: Mpo) -> bool {
        self.live.contains(&mpo)
    }

    pub fn live(&self) -> impl Iterator<Item = Mpo> + '_ {
        self.live.iter().copied()
    }

    /// Construct a complete object owned by `mpo` at `address`: the
    /// shared part, then this process's heap extension. A failed heap
    /// extension takes the shared part back down with it.
    pub fn construct_object(
        &mut self,
        mpo: Mpo,
        type_instance: TypeInstance,
        address: NetworkAddress,
    ) -> Result<Reference> {
        let reference = self.shared.construct(mpo, type_instance, address)?;
        if let Err(err) = self.ensure_heap(&reference) {
            if let Err(undo) = self.shared.free(&reference) {
                warn!(%reference, %undo, "failed to undo shared construction");
            }
            return Err(err);
        }
        Ok(reference)
    }

    /// This process's heap extension for `reference`, allocating on
    /// first use.
    pub fn ensure_heap(&mut self, reference: &Reference) -> Result<HeapKey> {
        let r = *heap_part(reference)?;
        let handle = self.shared.segment(r.mpo)?;
        let mut segment = lock_segment(&handle)?;
        let header = segment
            .header_mut(r.object)
            .ok_or(MemoryError::UnknownObject(*reference))?;
        self.heap.ensure_allocated(reference, header)
    }

    /// Mirror a remote simulation's object locally and allocate its heap
    /// extension.
    pub fn attach_remote(&mut self, remote: HeapRef, address: NetworkAddress) -> Result<Reference> {
        let reference = self.shared.attach(remote, address)?;
        self.ensure_heap(&reference)?;
        Ok(reference)
    }

    /// The local heap form backing `network`, when known here.
    pub fn try_network_to_heap(&self, network: NetworkRef) -> Option<Reference> {
        self.shared.try_network_to_heap(network)
    }

    /// The stored heap form registered for `address`, when known here.
    pub fn lookup(&self, address: NetworkAddress) -> Option<HeapRef> {
        self.shared.lookup(address)
    }

    /// Re-derive the network form of a reference.
    pub fn heap_to_network(&mut self, reference: &Reference) -> Result<NetworkRef> {
        self.shared.heap_to_network(reference)
    }

    /// Copy of the object's payload and freshness stamp.
    pub fn read_object(&mut self, reference: &Reference) -> Result<(Bytes, TimeStamp)> {
        self.shared.read_object(reference)
    }

    /// Write an image into the object and stamp its header.
    pub fn write_object(
        &mut self,
        reference: &Reference,
        image: &[u8],
        timestamp: TimeStamp,
    ) -> Result<()> {
        self.shared.write_object(reference, image, timestamp)
    }

    /// Cycle at which the object was last written.
    pub fn timestamp_of(&mut self, reference: &Reference) -> Result<TimeStamp> {
        self.shared.timestamp_of(reference)
    }

    /// Root object of a simulation live here.
    pub fn root_of(&self, mpo: Mpo) -> Result<Reference> {
        self.shared.root_of(mpo)
    }

    pub fn shared(&self) -> &SharedMemoryManager {
        &self.shared
    }

    pub fn heap(&self) -> &HeapMemoryManager {
        &self.heap
    }

    /// Tear down everything `mpo` owns: heap extensions first, then the
    /// shared objects and their segment.
    pub fn destroy(&mut self, mpo: Mpo) -> Result<()> {
        if !self.live.contains(&mpo) {
            return Err(MemoryError::NotLive(mpo));
        }
        let heap_count = self.heap.free_all(mpo)?;
        let shared_count = self.shared.free_all(mpo)?;
        self.live.remove(&mpo);
        debug!(%mpo, heap = heap_count, shared = shared_count, "destroyed simulation memory");
        Ok(())
    }

    /// Forget a destroyed remote simulation: free local heap extensions
    /// for its objects and drop the mirrors.
    pub fn release_remote(&mut self, mpo: Mpo) -> Result<()> {
        let heap_count = self.heap.free_all(mpo)?;
        let shared_count = self.shared.release_remote(mpo);
        debug!(%mpo, heap = heap_count, mirrors = shared_count, "released remote simulation");
        Ok(())
    }
}

impl std::fmt::Debug for LeafMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafMemory")
            .field("process", &self.process)
            .field("live", &self.live.len())
            .finish()
    }
}

/// Scope guard for one live simulation's memory.
pub struct MpoLifetime {
    memory: LeafMemoryHandle,
    mpo: Mpo,
    conversation: ConversationId,
    root: Reference,
}

impl MpoLifetime {
    /// Register `mpo` as live and construct its root object at
    /// `root_address`. Fails when the MPO is already live here; a
    /// failure partway leaves nothing registered or constructed.
    pub fn new(
        memory: LeafMemoryHandle,
        mpo: Mpo,
        conversation: ConversationId,
        root_address: NetworkAddress,
    ) -> Result<Self> {
        let root = {
            let mut guard = lock_memory(&memory)?;
            if !guard.live.insert(mpo) {
                return Err(MemoryError::AlreadyLive(mpo));
            }
            match guard.construct_object(mpo, TypeInstance::object(ROOT_TYPE_ID), root_address) {
                Ok(root) => {
                    guard.shared.set_root(mpo, root);
                    root
                }
                Err(err) => {
                    guard.live.remove(&mpo);
                    return Err(err);
                }
            }
        };
        debug!(%mpo, %conversation, %root, "simulation live");
        Ok(Self {
            memory,
            mpo,
            conversation,
            root,
        })
    }

    pub fn mpo(&self) -> Mpo {
        self.mpo
    }

    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// The simulation's root object, in heap form.
    pub fn root(&self) -> Reference {
        self.root
    }

    pub fn memory(&self) -> &LeafMemoryHandle {
        &self.memory
    }
}

impl Drop for MpoLifetime {
    fn drop(&mut self) {
        match lock_memory(&self.memory) {
            Ok(mut memory) => {
                if let Err(err) = memory.destroy(self.mpo) {
                    error!(mpo = %self.mpo, %err, "failed to destroy simulation memory");
                }
            }
            Err(err) => {
                error!(mpo = %self.mpo, %err, "memory unavailable during teardown");
            }
        }
    }
}

impl std::fmt::Debug for MpoLifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpoLifetime")
            .field("mpo", &self.mpo)
            .field("conversation", &self.conversation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FixedProvider, SizeAlignment};
    use crate::segment::{LocalSegmentNames, SegmentRegistry};
    use simmesh_ident::{MachineId, OwnerId};

    fn mpo(owner: u16) -> Mpo {
        Mpo::new(MachineId::new(0), ProcessId::new(0), OwnerId::new(owner))
    }

    fn memory(provider: FixedProvider) -> LeafMemoryHandle {
        LeafMemory::new(
            ProcessId::new(0),
            SegmentRegistry::new(),
            Arc::new(LocalSegmentNames),
            Arc::new(provider),
        )
        .into_handle()
    }

    #[test]
    fn lifetime_constructs_and_destroys_the_root() {
        let provider = FixedProvider::default();
        let counters = provider.counters();
        let handle = memory(provider);

        let lifetime = MpoLifetime::new(
            handle.clone(),
            mpo(1),
            ConversationId::new(),
            NetworkAddress::new(1),
        )
        .unwrap();

        {
            let guard = lock_memory(&handle).unwrap();
            assert!(guard.is_live(mpo(1)));
            assert_eq!(guard.root_of(mpo(1)).unwrap(), lifetime.root());
            assert_eq!(counters.shared_live(), 1);
            assert_eq!(counters.heap_live(), 1);
        }

        drop(lifetime);
        let guard = lock_memory(&handle).unwrap();
        assert!(!guard.is_live(mpo(1)));
        assert_eq!(counters.shared_live(), 0);
        assert_eq!(counters.heap_live(), 0);
        assert!(guard.root_of(mpo(1)).is_err());
    }

    #[test]
    fn double_registration_is_rejected() {
        let handle = memory(FixedProvider::default());
        let first = MpoLifetime::new(
            handle.clone(),
            mpo(2),
            ConversationId::new(),
            NetworkAddress::new(1),
        )
        .unwrap();

        let second = MpoLifetime::new(
            handle.clone(),
            mpo(2),
            ConversationId::new(),
            NetworkAddress::new(2),
        );
        assert!(matches!(second, Err(MemoryError::AlreadyLive(_))));

        // The first registration is untouched by the rejection.
        let guard = lock_memory(&handle).unwrap();
        assert!(guard.is_live(mpo(2)));
        assert_eq!(guard.root_of(mpo(2)).unwrap(), first.root());
    }

    #[test]
    fn failed_construction_leaves_nothing_behind() {
        // A heap layout the allocator rejects fails the second step of
        // root construction.
        let provider = FixedProvider::new(SizeAlignment::new(64, 8), SizeAlignment::new(16, 3));
        let counters = provider.counters();
        let handle = memory(provider);

        let result = MpoLifetime::new(
            handle.clone(),
            mpo(3),
            ConversationId::new(),
            NetworkAddress::new(1),
        );
        assert!(matches!(result, Err(MemoryError::InvalidLayout { .. })));

        let guard = lock_memory(&handle).unwrap();
        assert!(!guard.is_live(mpo(3)));
        assert_eq!(counters.shared_live(), 0);
        assert_eq!(counters.heap_live(), 0);
    }

    #[test]
    fn destroy_requires_a_live_registration() {
        let handle = memory(FixedProvider::default());
        let mut guard = lock_memory(&handle).unwrap();
        assert!(matches!(
            guard.destroy(mpo(9)),
            Err(MemoryError::NotLive(_))
        ));
    }
}
