//! Shared-part memory manager.
//!
//! One manager per leaf process. It owns the shared half of every object
//! the process constructs: the buffer in the owning simulation's segment,
//! the network-address map that resolves network references locally, and
//! the per-simulation root record. Objects owned by other simulations can
//! be mirrored by attaching their segment; mirrors are tracked separately
//! so teardown never runs a destructor this process does not own.
//!
//! The manager takes no locks of its own beyond the per-segment mutex; the
//! callers already hold whatever simulation lock the access requires.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use simmesh_ident::{
    HeapRef, Mpo, NetworkAddress, NetworkRef, ObjectId, Reference, TimeStamp, TypeInstance,
    ROOT_OBJECT_ID, ROOT_TYPE_ID,
};

use crate::buf::AlignedBuf;
use crate::error::{MemoryError, Result};
use crate::provider::{CodeProvider, FnCache};
use crate::segment::{lock_segment, SegmentAccess, SegmentHandle, SegmentRegistry, SharedHeader};

/// The heap-form contents of `reference`, or [`MemoryError::WrongForm`].
pub(crate) fn heap_part(reference: &Reference) -> Result<&HeapRef> {
    reference.as_heap().ok_or(MemoryError::WrongForm {
        expected: "heap",
        reference: *reference,
    })
}

/// Manager of the shared parts of this process's objects.
pub struct SharedMemoryManager {
    registry: SegmentRegistry,
    access: Arc<dyn SegmentAccess>,
    functions: FnCache,
    /// Opened segment handles, one per simulation touched so far.
    segments: HashMap<Mpo, SegmentHandle>,
    /// Resolved segment names; the accessor is asked once per simulation.
    names: HashMap<Mpo, String>,
    /// Next object slot per owned simulation.
    object_slots: HashMap<Mpo, u16>,
    /// Objects this process constructed and owns.
    constructed: BTreeSet<Reference>,
    /// Mirrors of objects owned elsewhere.
    attached: BTreeSet<Reference>,
    /// Network address to local heap form, owned and mirrored alike.
    net_map: HashMap<NetworkAddress, HeapRef>,
    /// Root object per locally owned simulation.
    roots: HashMap<Mpo, Reference>,
}

impl SharedMemoryManager {
    pub fn new(
        registry: SegmentRegistry,
        access: Arc<dyn SegmentAccess>,
        provider: Arc<dyn CodeProvider>,
    ) -> Self {
        Self {
            registry,
            access,
            functions: FnCache::new(provider),
            segments: HashMap::new(),
            names: HashMap::new(),
            object_slots: HashMap::new(),
            constructed: BTreeSet::new(),
            attached: BTreeSet::new(),
            net_map: HashMap::new(),
            roots: HashMap::new(),
        }
    }

    /// The segment holding `mpo`'s objects, resolving the name and
    /// opening it on first use.
    pub fn segment(&mut self, mpo: Mpo) -> Result<SegmentHandle> {
        if let Some(handle) = self.segments.get(&mpo) {
            return Ok(handle.clone());
        }
        let name = self.segment_name(mpo)?;
        let handle = self.registry.open_or_create(&name)?;
        self.segments.insert(mpo, handle.clone());
        Ok(handle)
    }

    fn segment_name(&mut self, mpo: Mpo) -> Result<String> {
        if let Some(name) = self.names.get(&mpo) {
            return Ok(name.clone());
        }
        let name = self.access.acquire(mpo)?;
        self.names.insert(mpo, name.clone());
        Ok(name)
    }

    /// Construct the shared part of a new object owned by `mpo`,
    /// assigned the next object slot and recorded under `address`.
    pub fn construct(
        &mut self,
        mpo: Mpo,
        type_instance: TypeInstance,
        address: NetworkAddress,
    ) -> Result<Reference> {
        let functions = self.functions.get(type_instance.type_id)?;
        let object = self.next_object(mpo);
        // The root object always takes the first slot of its simulation.
        debug_assert!(type_instance.type_id != ROOT_TYPE_ID || object == ROOT_OBJECT_ID);

        let mut data = AlignedBuf::new(functions.shared)?;
        (functions.shared_ctor)(data.as_mut_slice());
        let handle = self.segment(mpo)?;
        {
            let mut segment = lock_segment(&handle)?;
            segment.insert(object, SharedHeader::new(address), data);
        }

        let heap = HeapRef {
            type_instance,
            mpo,
            object,
            lock_cycle: TimeStamp::new(0),
        };
        let reference = Reference::Heap(heap);
        self.constructed.insert(reference);
        self.net_map.insert(address, heap);
        debug!(%reference, %address, "constructed shared object");
        Ok(reference)
    }

    fn next_object(&mut self, mpo: Mpo) -> ObjectId {
        let slot = self
            .object_slots
            .entry(mpo)
            .or_insert(ROOT_OBJECT_ID.value());
        let object = ObjectId::new(*slot);
        *slot += 1;
        object
    }

    /// Construct at most once: a second request for the same address
    /// returns the existing object untouched.
    pub fn ensure_constructed(
        &mut self,
        mpo: Mpo,
        type_instance: TypeInstance,
        address: NetworkAddress,
    ) -> Result<Reference> {
        if let Some(existing) = self.net_map.get(&address) {
            return Ok(Reference::Heap(*existing));
        }
        self.construct(mpo, type_instance, address)
    }

    /// The local heap form backing `network`, when the object lives or is
    /// mirrored in this process. A sub-instance request resolves to the
    /// same object slot under the requested type/instance.
    pub fn try_network_to_heap(&self, network: NetworkRef) -> Option<Reference> {
        self.net_map.get(&network.address).map(|stored| {
            Reference::heap(
                network.type_instance,
                stored.mpo,
                stored.object,
                stored.lock_cycle,
            )
        })
    }

    /// The stored heap form registered for `address`, exactly as it was
    /// recorded at construction or attach.
    pub fn lookup(&self, address: NetworkAddress) -> Option<HeapRef> {
        self.net_map.get(&address).copied()
    }

    /// Re-derive the network form of a heap reference from the object's
    /// header.
    pub fn heap_to_network(&mut self, reference: &Reference) -> Result<NetworkRef> {
        match reference {
            Reference::Network(r) => Ok(*r),
            Reference::Heap(r) => {
                let handle = self.segment(r.mpo)?;
                let segment = lock_segment(&handle)?;
                let header = segment
                    .header(r.object)
                    .ok_or(MemoryError::UnknownObject(*reference))?;
                Ok(NetworkRef {
                    type_instance: r.type_instance,
                    address: header.network_address(),
                })
            }
        }
    }

    /// Copy of the object's payload together with its freshness stamp.
    pub fn read_object(&mut self, reference: &Reference) -> Result<(Bytes, TimeStamp)> {
        let r = *heap_part(reference)?;
        let handle = self.segment(r.mpo)?;
        let segment = lock_segment(&handle)?;
        let bytes = segment
            .bytes(r.object)
            .ok_or(MemoryError::UnknownObject(*reference))?;
        let header = segment
            .header(r.object)
            .ok_or(MemoryError::UnknownObject(*reference))?;
        Ok((Bytes::copy_from_slice(bytes), header.timestamp()))
    }

    /// Write an image into the object's payload and stamp the header. The
    /// image may be shorter than the object; the tail is untouched.
    pub fn write_object(
        &mut self,
        reference: &Reference,
        image: &[u8],
        timestamp: TimeStamp,
    ) -> Result<()> {
        let r = *heap_part(reference)?;
        let handle = self.segment(r.mpo)?;
        let mut segment = lock_segment(&handle)?;
        let (header, bytes) = segment
            .parts_mut(r.object)
            .ok_or(MemoryError::UnknownObject(*reference))?;
        if image.len() > bytes.len() {
            return Err(MemoryError::ImageSize {
                image: image.len(),
                object: bytes.len(),
            });
        }
        bytes[..image.len()].copy_from_slice(image);
        header.set_timestamp(timestamp);
        Ok(())
    }

    /// Cycle at which the object's payload was last written.
    pub fn timestamp_of(&mut self, reference: &Reference) -> Result<TimeStamp> {
        let r = *heap_part(reference)?;
        let handle = self.segment(r.mpo)?;
        let segment = lock_segment(&handle)?;
        let header = segment
            .header(r.object)
            .ok_or(MemoryError::UnknownObject(*reference))?;
        Ok(header.timestamp())
    }

    /// Mirror a remote simulation's object in this process: open the
    /// owner's segment and record the address mapping. Nothing is
    /// constructed; the owner already built the object.
    pub fn attach(&mut self, remote: HeapRef, address: NetworkAddress) -> Result<Reference> {
        if !self.segments.contains_key(&remote.mpo) {
            let name = self.segment_name(remote.mpo)?;
            // The owner creates the segment; attaching cannot.
            let handle = self.registry.open(&name)?;
            self.segments.insert(remote.mpo, handle);
        }
        let reference = Reference::Heap(remote);
        self.attached.insert(reference);
        self.net_map.insert(address, remote);
        debug!(%reference, %address, "attached remote object");
        Ok(reference)
    }

    pub(crate) fn set_root(&mut self, mpo: Mpo, reference: Reference) {
        self.roots.insert(mpo, reference);
    }

    /// Root object of a locally owned simulation.
    pub fn root_of(&self, mpo: Mpo) -> Result<Reference> {
        self.roots.get(&mpo).copied().ok_or(MemoryError::NoRoot(mpo))
    }

    /// Destroy one owned object: run the shared destructor and drop every
    /// record of it.
    pub fn free(&mut self, reference: &Reference) -> Result<()> {
        let r = *heap_part(reference)?;
        if !self.constructed.remove(reference) {
            return Err(MemoryError::UnknownObject(*reference));
        }
        let functions = self.functions.get(r.type_instance.type_id)?;
        let handle = self.segment(r.mpo)?;
        let removed = {
            let mut segment = lock_segment(&handle)?;
            segment.remove(r.object)
        };
        let Some((header, mut data)) = removed else {
            return Err(MemoryError::UnknownObject(*reference));
        };
        (functions.shared_dtor)(data.as_mut_slice());
        self.net_map.remove(&header.network_address());
        if self.roots.get(&r.mpo) == Some(reference) {
            self.roots.remove(&r.mpo);
        }
        Ok(())
    }

    /// Destroy every object `mpo` owns and release its segment. Returns
    /// how many objects were destroyed.
    pub fn free_all(&mut self, mpo: Mpo) -> Result<usize> {
        let owned: Vec<Reference> = self
            .constructed
            .range(Reference::mpo_floor(mpo)..)
            .take_while(|r| r.mpo() == Some(mpo))
            .copied()
            .collect();
        for reference in &owned {
            self.free(reference)?;
        }
        if let Some(name) = self.names.remove(&mpo) {
            self.registry.remove(&name)?;
        }
        self.segments.remove(&mpo);
        self.object_slots.remove(&mpo);
        self.roots.remove(&mpo);
        debug!(%mpo, count = owned.len(), "released shared memory");
        Ok(owned.len())
    }

    /// Forget every mirror of a destroyed remote simulation. Destructors
    /// do not run; the owner tore the objects down. Returns how many
    /// mirrors were dropped.
    pub fn release_remote(&mut self, mpo: Mpo) -> usize {
        let mirrored: Vec<Reference> = self
            .attached
            .range(Reference::mpo_floor(mpo)..)
            .take_while(|r| r.mpo() == Some(mpo))
            .copied()
            .collect();
        for reference in &mirrored {
            self.attached.remove(reference);
        }
        self.net_map.retain(|_, stored| stored.mpo != mpo);
        self.names.remove(&mpo);
        self.segments.remove(&mpo);
        debug!(%mpo, count = mirrored.len(), "released remote mirrors");
        mirrored.len()
    }

    /// Whether this process constructed and still owns `reference`.
    pub fn contains(&self, reference: &Reference) -> bool {
        self.constructed.contains(reference)
    }
}

impl std::fmt::Debug for SharedMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryManager")
            .field("constructed", &self.constructed.len())
            .field("attached", &self.attached.len())
            .field("segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FixedProvider;
    use crate::segment::LocalSegmentNames;
    use simmesh_ident::{MachineId, OwnerId, ProcessId, TypeId};

    fn mpo(owner: u16) -> Mpo {
        Mpo::new(MachineId::new(0), ProcessId::new(0), OwnerId::new(owner))
    }

    fn manager(
        registry: &SegmentRegistry,
    ) -> (SharedMemoryManager, Arc<crate::provider::ProviderCounters>) {
        let provider = FixedProvider::default();
        let counters = provider.counters();
        let manager = SharedMemoryManager::new(
            registry.clone(),
            Arc::new(LocalSegmentNames),
            Arc::new(provider),
        );
        (manager, counters)
    }

    #[test]
    fn construct_round_trips_through_both_forms() {
        let registry = SegmentRegistry::new();
        let (mut shared, _) = manager(&registry);
        let ti = TypeInstance::object(TypeId::new(1));
        let address = NetworkAddress::new(7);

        let heap = shared.construct(mpo(1), ti, address).unwrap();
        let net = shared.heap_to_network(&heap).unwrap();
        assert_eq!(net.address, address);

        let back = shared
            .try_network_to_heap(NetworkRef {
                type_instance: ti,
                address,
            })
            .unwrap();
        assert_eq!(back, heap);
    }

    #[test]
    fn sub_instance_requests_resolve_to_the_same_slot() {
        let registry = SegmentRegistry::new();
        let (mut shared, _) = manager(&registry);
        let address = NetworkAddress::new(3);
        let whole = TypeInstance::object(TypeId::new(1));
        let part = TypeInstance::new(2, TypeId::new(5));

        let heap = shared.construct(mpo(1), whole, address).unwrap();
        let sub = shared
            .try_network_to_heap(NetworkRef {
                type_instance: part,
                address,
            })
            .unwrap();
        assert_eq!(sub.type_instance(), part);
        assert_eq!(sub.as_heap().unwrap().object, heap.as_heap().unwrap().object);
        assert_eq!(sub.mpo(), heap.mpo());
    }

    #[test]
    fn ensure_constructed_builds_at_most_once() {
        let registry = SegmentRegistry::new();
        let (mut shared, counters) = manager(&registry);
        let ti = TypeInstance::object(TypeId::new(1));
        let address = NetworkAddress::new(9);

        let first = shared.ensure_constructed(mpo(2), ti, address).unwrap();
        let second = shared.ensure_constructed(mpo(2), ti, address).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            counters
                .shared_ctor
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn writes_stamp_the_header_and_respect_the_object_size() {
        let registry = SegmentRegistry::new();
        let (mut shared, _) = manager(&registry);
        let ti = TypeInstance::object(TypeId::new(1));
        let heap = shared.construct(mpo(1), ti, NetworkAddress::new(1)).unwrap();

        shared
            .write_object(&heap, &[1, 2, 3], TimeStamp::new(4))
            .unwrap();
        let (bytes, stamp) = shared.read_object(&heap).unwrap();
        assert_eq!(&bytes[..3], &[1, 2, 3]);
        assert_eq!(stamp, TimeStamp::new(4));
        assert_eq!(shared.timestamp_of(&heap).unwrap(), TimeStamp::new(4));

        let oversized = vec![0u8; 1024];
        assert!(matches!(
            shared.write_object(&heap, &oversized, TimeStamp::new(5)),
            Err(MemoryError::ImageSize { .. })
        ));
    }

    #[test]
    fn free_all_destroys_everything_and_releases_the_segment() {
        let registry = SegmentRegistry::new();
        let (mut shared, counters) = manager(&registry);
        let ti = TypeInstance::object(TypeId::new(1));
        let other = TypeInstance::object(TypeId::new(2));

        shared.construct(mpo(1), ti, NetworkAddress::new(1)).unwrap();
        shared
            .construct(mpo(1), other, NetworkAddress::new(2))
            .unwrap();
        let kept = shared
            .construct(mpo(2), ti, NetworkAddress::new(3))
            .unwrap();

        assert_eq!(shared.free_all(mpo(1)).unwrap(), 2);
        assert_eq!(counters.shared_live(), 1);
        assert!(shared.contains(&kept));
        assert!(!registry
            .contains(&LocalSegmentNames.acquire(mpo(1)).unwrap())
            .unwrap());
        assert!(shared
            .try_network_to_heap(NetworkRef {
                type_instance: ti,
                address: NetworkAddress::new(1),
            })
            .is_none());
    }

    #[test]
    fn attach_reads_the_owner_segment_without_owning_it() {
        let registry = SegmentRegistry::new();
        let (mut owner, owner_counters) = manager(&registry);
        let (mut mirror, mirror_counters) = manager(&registry);
        let ti = TypeInstance::object(TypeId::new(1));
        let address = NetworkAddress::new(11);

        let built = owner.construct(mpo(1), ti, address).unwrap();
        owner
            .write_object(&built, &[0xaa, 0xbb], TimeStamp::new(2))
            .unwrap();

        let remote = *built.as_heap().unwrap();
        let attached = mirror.attach(remote, address).unwrap();
        let (bytes, stamp) = mirror.read_object(&attached).unwrap();
        assert_eq!(&bytes[..2], &[0xaa, 0xbb]);
        assert_eq!(stamp, TimeStamp::new(2));
        assert_eq!(
            mirror_counters
                .shared_ctor
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );

        // The mirror cannot free the owner's object.
        assert!(matches!(
            mirror.free(&attached),
            Err(MemoryError::UnknownObject(_))
        ));
        assert_eq!(mirror.release_remote(mpo(1)), 1);
        assert_eq!(owner_counters.shared_live(), 1);
    }

    #[test]
    fn attach_requires_an_existing_segment() {
        let registry = SegmentRegistry::new();
        let (mut mirror, _) = manager(&registry);
        let remote = HeapRef {
            type_instance: TypeInstance::object(TypeId::new(1)),
            mpo: mpo(5),
            object: ObjectId::new(0),
            lock_cycle: TimeStamp::new(0),
        };
        assert!(matches!(
            mirror.attach(remote, NetworkAddress::new(1)),
            Err(MemoryError::SegmentUnavailable(_))
        ));
    }
}
