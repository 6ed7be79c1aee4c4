//! The logical address space.
//!
//! An object's network address is stable for as long as any process might
//! reference it; which MPO owns the object right now is a separate fact.
//! Keeping the two apart is what lets ownership move between processes
//! without renumbering live references.

use std::collections::HashMap;

use tracing::debug;

use simmesh_ident::{Mpo, NetworkAddress, TypeId};

use crate::error::{AddressError, Result};

/// Ownership record for one allocated address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owned {
    mpo: Mpo,
    type_id: TypeId,
}

/// Root-owned table of network addresses and their owners.
///
/// Addresses are minted monotonically from 1; freed addresses go to a
/// reuse free-list. An address is either free (in the free-list, no owner)
/// or owned (in the ownership map) - never both.
#[derive(Debug)]
pub struct AddressSpace {
    /// Next never-issued address.
    capacity: NetworkAddress,
    free: Vec<NetworkAddress>,
    owners: HashMap<NetworkAddress, Owned>,
    /// Root object address per live MPO.
    roots: HashMap<Mpo, NetworkAddress>,
}

impl AddressSpace {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self {
            capacity: NetworkAddress::FIRST,
            free: Vec::new(),
            owners: HashMap::new(),
            roots: HashMap::new(),
        }
    }

    /// Allocate an address for an object of `type_id` owned by `mpo`.
    ///
    /// Pops the free-list when possible, otherwise grows the capacity
    /// counter.
    pub fn allocate(&mut self, mpo: Mpo, type_id: TypeId) -> NetworkAddress {
        let address = match self.free.pop() {
            Some(address) => address,
            None => {
                let fresh = self.capacity;
                self.capacity = self.capacity.next();
                fresh
            }
        };
        debug_assert!(!self.owners.contains_key(&address));
        self.owners.insert(address, Owned { mpo, type_id });
        debug!(%address, %mpo, %type_id, "allocated network address");
        address
    }

    /// Return an address to the free-list. The caller must be its owner.
    pub fn deallocate(&mut self, mpo: Mpo, address: NetworkAddress) -> Result<()> {
        let owned = self
            .owners
            .get(&address)
            .copied()
            .ok_or(AddressError::UnknownAddress(address))?;
        if owned.mpo != mpo {
            return Err(AddressError::NotOwner {
                address,
                owner: owned.mpo,
                caller: mpo,
            });
        }
        self.owners.remove(&address);
        self.free.push(address);
        debug!(%address, %mpo, "deallocated network address");
        Ok(())
    }

    /// The MPO currently owning an address.
    pub fn ownership(&self, address: NetworkAddress) -> Result<Mpo> {
        self.owners
            .get(&address)
            .map(|owned| owned.mpo)
            .ok_or(AddressError::UnknownAddress(address))
    }

    /// The type recorded for an address at allocation.
    pub fn object_type(&self, address: NetworkAddress) -> Result<TypeId> {
        self.owners
            .get(&address)
            .map(|owned| owned.type_id)
            .ok_or(AddressError::UnknownAddress(address))
    }

    /// Shrink the capacity counter while the tail of the free-list is
    /// contiguous with it.
    pub fn defrag(&mut self) {
        self.free.sort_unstable();
        while self
            .free
            .last()
            .is_some_and(|last| last.next() == self.capacity)
        {
            self.free.pop();
            self.capacity = NetworkAddress::new(self.capacity.value() - 1);
        }
        debug!(capacity = %self.capacity, free = self.free.len(), "defragged address space");
    }

    /// Free every address still owned by `mpo`, returning how many were
    /// swept. Used at simulation teardown, when the owner can no longer
    /// deallocate for itself.
    pub fn release_owned(&mut self, mpo: Mpo) -> usize {
        let doomed: Vec<NetworkAddress> = self
            .owners
            .iter()
            .filter(|(_, owned)| owned.mpo == mpo)
            .map(|(address, _)| *address)
            .collect();
        for address in &doomed {
            self.owners.remove(address);
            self.free.push(*address);
        }
        debug!(%mpo, count = doomed.len(), "released owned addresses");
        doomed.len()
    }

    /// Record `address` as the root object of `mpo`.
    pub fn set_root(&mut self, mpo: Mpo, address: NetworkAddress) {
        self.roots.insert(mpo, address);
    }

    /// The root object address of a live MPO.
    pub fn root_of(&self, mpo: Mpo) -> Result<NetworkAddress> {
        self.roots
            .get(&mpo)
            .copied()
            .ok_or(AddressError::UnknownRoot(mpo))
    }

    /// Forget the root record of an MPO (at simulation teardown).
    pub fn clear_root(&mut self, mpo: Mpo) -> Option<NetworkAddress> {
        self.roots.remove(&mpo)
    }

    /// Number of currently owned addresses.
    pub fn owned(&self) -> usize {
        self.owners.len()
    }

    /// The next never-issued address (capacity counter).
    pub fn capacity(&self) -> NetworkAddress {
        self.capacity
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simmesh_ident::{MachineId, OwnerId, ProcessId};

    fn mpo(o: u16) -> Mpo {
        Mpo::new(MachineId::new(0), ProcessId::new(0), OwnerId::new(o))
    }

    const T: TypeId = TypeId::new(9);

    #[test]
    fn first_allocation_is_address_one() {
        let mut space = AddressSpace::new();
        assert_eq!(space.allocate(mpo(1), T), NetworkAddress::new(1));
        assert_eq!(space.capacity(), NetworkAddress::new(2));
    }

    #[test]
    fn freed_addresses_are_reused_across_owners() {
        let mut space = AddressSpace::new();
        let a = space.allocate(mpo(1), T);
        space.deallocate(mpo(1), a).unwrap();
        let b = space.allocate(mpo(2), T);
        assert_eq!(a, b);
        assert_eq!(space.ownership(b).unwrap(), mpo(2));
    }

    #[test]
    fn defrag_shrinks_contiguous_tail() {
        let mut space = AddressSpace::new();
        let a = space.allocate(mpo(1), T);
        space.deallocate(mpo(1), a).unwrap();
        assert_eq!(space.capacity(), NetworkAddress::new(2));
        space.defrag();
        assert_eq!(space.capacity(), NetworkAddress::new(1));
        // the reclaimed number is minted fresh again
        assert_eq!(space.allocate(mpo(1), T), NetworkAddress::new(1));
    }

    #[test]
    fn defrag_stops_at_a_hole() {
        let mut space = AddressSpace::new();
        let a1 = space.allocate(mpo(1), T);
        let _a2 = space.allocate(mpo(1), T);
        let a3 = space.allocate(mpo(1), T);
        space.deallocate(mpo(1), a1).unwrap();
        space.deallocate(mpo(1), a3).unwrap();
        space.defrag();
        // address 3 reclaimed, address 1 still free behind the held 2
        assert_eq!(space.capacity(), NetworkAddress::new(3));
        assert_eq!(space.ownership(a1), Err(AddressError::UnknownAddress(a1)));
    }

    #[test]
    fn deallocate_requires_the_owner() {
        let mut space = AddressSpace::new();
        let a = space.allocate(mpo(1), T);
        let err = space.deallocate(mpo(2), a).unwrap_err();
        assert_eq!(
            err,
            AddressError::NotOwner {
                address: a,
                owner: mpo(1),
                caller: mpo(2),
            }
        );
        // still owned after the failed call
        assert_eq!(space.ownership(a).unwrap(), mpo(1));
    }

    #[test]
    fn no_double_issue_while_owned() {
        let mut space = AddressSpace::new();
        let mut held = std::collections::HashSet::new();
        for i in 0..8 {
            assert!(held.insert(space.allocate(mpo(i), T)));
        }
        space.deallocate(mpo(3), NetworkAddress::new(4)).unwrap();
        held.remove(&NetworkAddress::new(4));
        for _ in 0..2 {
            let a = space.allocate(mpo(9), T);
            assert!(held.insert(a), "address {a} double issued");
        }
    }

    #[test]
    fn release_owned_sweeps_one_owner() {
        let mut space = AddressSpace::new();
        let a = space.allocate(mpo(1), T);
        let b = space.allocate(mpo(2), T);
        let c = space.allocate(mpo(1), T);

        assert_eq!(space.release_owned(mpo(1)), 2);
        assert_eq!(space.ownership(a), Err(AddressError::UnknownAddress(a)));
        assert_eq!(space.ownership(c), Err(AddressError::UnknownAddress(c)));
        assert_eq!(space.ownership(b).unwrap(), mpo(2));

        // the swept tail is reclaimable; the held address 2 blocks the rest
        space.defrag();
        assert_eq!(space.capacity(), NetworkAddress::new(3));
    }

    #[test]
    fn root_book_round_trips() {
        let mut space = AddressSpace::new();
        let a = space.allocate(mpo(1), T);
        space.set_root(mpo(1), a);
        assert_eq!(space.root_of(mpo(1)).unwrap(), a);
        assert_eq!(space.clear_root(mpo(1)), Some(a));
        assert_eq!(space.root_of(mpo(1)), Err(AddressError::UnknownRoot(mpo(1))));
    }
}
