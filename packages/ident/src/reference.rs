//! Typed object references in network and heap form.
//!
//! A [`Reference`] identifies one object instance. In network form it pairs
//! a [`TypeInstance`] with a location-independent [`NetworkAddress`]; in
//! heap form it names the object slot within its owning [`Mpo`], resolvable
//! to a buffer through the memory managers. Conversion between the two is a
//! core runtime operation.
//!
//! The heap form carries a [`TimeStamp`] recording the lock cycle at which
//! its contents were last refreshed. The timestamp is a freshness
//! annotation, not identity: equality, ordering and hashing ignore it.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::mpo::Mpo;

/// Identifier of one generated object type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TypeId(i16);

impl TypeId {
    /// Wrap a raw type identifier.
    pub const fn new(id: i16) -> Self {
        Self(id)
    }

    /// The raw type identifier.
    pub const fn value(self) -> i16 {
        self.0
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-MPO slot of one object instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ObjectId(u16);

impl ObjectId {
    /// Wrap a raw object slot.
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// The raw object slot.
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A concrete instance of a type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TypeInstance {
    /// Instance index within the object.
    pub instance: u16,
    /// The instantiated type.
    pub type_id: TypeId,
}

impl TypeInstance {
    /// Build a type/instance pair.
    pub const fn new(instance: u16, type_id: TypeId) -> Self {
        Self { instance, type_id }
    }

    /// The zeroth instance of a type, used for whole-object references.
    pub const fn object(type_id: TypeId) -> Self {
        Self {
            instance: 0,
            type_id,
        }
    }
}

impl std::fmt::Display for TypeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_id, self.instance)
    }
}

/// Simulation cycle counter. Cycle 1 is the first cycle after construction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TimeStamp(u32);

impl TimeStamp {
    /// The timestamp of a freshly constructed simulation.
    pub const FIRST: TimeStamp = TimeStamp(1);

    /// Wrap a raw cycle count.
    pub const fn new(cycle: u32) -> Self {
        Self(cycle)
    }

    /// The raw cycle count.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// The following cycle.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Location-independent slot of one object in the mesh address space.
///
/// Addresses are minted by the root starting at 1; 0 is never issued.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct NetworkAddress(u64);

impl NetworkAddress {
    /// The first address the space hands out.
    pub const FIRST: NetworkAddress = NetworkAddress(1);

    /// Wrap a raw address.
    pub const fn new(address: u64) -> Self {
        Self(address)
    }

    /// The raw address.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The next address in sequence.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network form: where the object logically lives, regardless of owner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NetworkRef {
    /// The addressed type/instance.
    pub type_instance: TypeInstance,
    /// The object's logical slot.
    pub address: NetworkAddress,
}

/// Heap form: the object slot within its owning process, plus the lock
/// cycle at which the local buffer contents were last refreshed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeapRef {
    /// The addressed type/instance.
    pub type_instance: TypeInstance,
    /// The owning simulation.
    pub mpo: Mpo,
    /// Object slot within the owning simulation.
    pub object: ObjectId,
    /// Freshness annotation; excluded from equality, ordering and hashing.
    pub lock_cycle: TimeStamp,
}

impl PartialEq for HeapRef {
    fn eq(&self, other: &Self) -> bool {
        self.type_instance == other.type_instance
            && self.mpo == other.mpo
            && self.object == other.object
    }
}

impl Eq for HeapRef {}

impl Hash for HeapRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_instance.hash(state);
        self.mpo.hash(state);
        self.object.hash(state);
    }
}

impl PartialOrd for HeapRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapRef {
    fn cmp(&self, other: &Self) -> Ordering {
        // MPO-major so reference collections group by owning simulation.
        (self.mpo, self.object, self.type_instance).cmp(&(
            other.mpo,
            other.object,
            other.type_instance,
        ))
    }
}

/// Typed handle to one object instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reference {
    /// Location-independent form.
    Network(NetworkRef),
    /// Process-local form.
    Heap(HeapRef),
}

impl Reference {
    /// Build a network-form reference.
    pub const fn network(type_instance: TypeInstance, address: NetworkAddress) -> Self {
        Self::Network(NetworkRef {
            type_instance,
            address,
        })
    }

    /// Build a heap-form reference stamped with the given lock cycle.
    pub const fn heap(
        type_instance: TypeInstance,
        mpo: Mpo,
        object: ObjectId,
        lock_cycle: TimeStamp,
    ) -> Self {
        Self::Heap(HeapRef {
            type_instance,
            mpo,
            object,
            lock_cycle,
        })
    }

    /// The addressed type/instance.
    pub fn type_instance(&self) -> TypeInstance {
        match self {
            Self::Network(r) => r.type_instance,
            Self::Heap(r) => r.type_instance,
        }
    }

    /// The addressed type.
    pub fn type_id(&self) -> TypeId {
        self.type_instance().type_id
    }

    /// Whether this is the network form.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Whether this is the heap form.
    pub fn is_heap(&self) -> bool {
        matches!(self, Self::Heap(_))
    }

    /// The owning MPO, if in heap form.
    pub fn mpo(&self) -> Option<Mpo> {
        match self {
            Self::Network(_) => None,
            Self::Heap(r) => Some(r.mpo),
        }
    }

    /// The logical address, if in network form.
    pub fn network_address(&self) -> Option<NetworkAddress> {
        match self {
            Self::Network(r) => Some(r.address),
            Self::Heap(_) => None,
        }
    }

    /// The heap form contents, if in heap form.
    pub fn as_heap(&self) -> Option<&HeapRef> {
        match self {
            Self::Network(_) => None,
            Self::Heap(r) => Some(r),
        }
    }

    /// This reference restamped with a lock cycle (heap form only; the
    /// network form is returned unchanged).
    pub fn with_lock_cycle(self, lock_cycle: TimeStamp) -> Self {
        match self {
            Self::Network(r) => Self::Network(r),
            Self::Heap(r) => Self::Heap(HeapRef { lock_cycle, ..r }),
        }
    }

    /// The least heap-form reference under `mpo`; the lower bound for
    /// per-simulation range sweeps over ordered reference collections.
    pub const fn mpo_floor(mpo: Mpo) -> Self {
        Self::heap(
            TypeInstance::new(0, TypeId::new(i16::MIN)),
            mpo,
            ObjectId::new(0),
            TimeStamp::new(0),
        )
    }
}

impl PartialOrd for Reference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Reference {
    fn cmp(&self, other: &Self) -> Ordering {
        // Heap form sorts first; within each form, field order as above.
        match (self, other) {
            (Self::Heap(a), Self::Heap(b)) => a.cmp(b),
            (Self::Network(a), Self::Network(b)) => {
                (a.address, a.type_instance).cmp(&(b.address, b.type_instance))
            }
            (Self::Heap(_), Self::Network(_)) => Ordering::Less,
            (Self::Network(_), Self::Heap(_)) => Ordering::Greater,
        }
    }
}

impl From<NetworkRef> for Reference {
    fn from(r: NetworkRef) -> Self {
        Self::Network(r)
    }
}

impl From<HeapRef> for Reference {
    fn from(r: HeapRef) -> Self {
        Self::Heap(r)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(r) => write!(f, "{}@net:{}", r.type_instance, r.address),
            Self::Heap(r) => write!(f, "{}@{}:{}", r.type_instance, r.mpo, r.object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpo::{MachineId, OwnerId, ProcessId};

    fn mpo(m: u8, p: u8, o: u16) -> Mpo {
        Mpo::new(MachineId::new(m), ProcessId::new(p), OwnerId::new(o))
    }

    fn heap(m: u8, o: u16, object: u16, cycle: u32) -> Reference {
        Reference::heap(
            TypeInstance::object(TypeId::new(4)),
            mpo(m, 0, o),
            ObjectId::new(object),
            TimeStamp::new(cycle),
        )
    }

    #[test]
    fn lock_cycle_is_not_identity() {
        let a = heap(0, 1, 0, 1);
        let b = heap(0, 1, 0, 7);
        assert_eq!(a, b);
        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn heap_ordering_groups_by_mpo() {
        let mut v = vec![heap(1, 0, 0, 1), heap(0, 2, 5, 1), heap(0, 2, 1, 1)];
        v.sort();
        assert_eq!(
            v.iter().map(|r| r.mpo().unwrap()).collect::<Vec<_>>(),
            vec![mpo(0, 0, 2), mpo(0, 0, 2), mpo(1, 0, 0)]
        );
        assert_eq!(
            v.iter()
                .map(|r| r.as_heap().unwrap().object.value())
                .collect::<Vec<_>>(),
            vec![1, 5, 0]
        );
    }

    #[test]
    fn restamping_preserves_identity() {
        let a = heap(2, 3, 1, 1);
        let b = a.with_lock_cycle(TimeStamp::new(9));
        assert_eq!(a, b);
        assert_eq!(b.as_heap().unwrap().lock_cycle, TimeStamp::new(9));
    }

    #[test]
    fn mpo_floor_bounds_every_owned_reference() {
        use std::collections::BTreeSet;
        let mut set = BTreeSet::new();
        set.insert(heap(0, 1, 3, 1));
        set.insert(heap(0, 2, 0, 1));
        set.insert(heap(0, 2, 4, 1));
        set.insert(heap(1, 0, 0, 1));

        let swept: Vec<_> = set
            .range(Reference::mpo_floor(mpo(0, 0, 2))..)
            .take_while(|r| r.mpo() == Some(mpo(0, 0, 2)))
            .collect();
        assert_eq!(swept.len(), 2);
        assert!(swept
            .iter()
            .all(|r| r.mpo() == Some(mpo(0, 0, 2))));
    }

    #[test]
    fn serde_round_trip() {
        let r = Reference::network(
            TypeInstance::new(2, TypeId::new(7)),
            NetworkAddress::new(41),
        );
        let json = serde_json::to_string(&r).unwrap();
        let back: Reference = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }
}
