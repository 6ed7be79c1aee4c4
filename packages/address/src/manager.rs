//! The execution-context manager.
//!
//! MPO identifiers are minted hierarchically: a machine slot when a daemon
//! enrolls, a process slot under that machine when a leaf enrolls, an owner
//! slot under that leaf when a simulation starts. Disconnecting a level
//! cascades: every allocator and conversation mapping nested under it is
//! reclaimed.

use std::collections::HashMap;

use tracing::{debug, info};

use simmesh_ident::{
    ConversationId, MachineId, Mp, Mpo, OwnerId, ProcessId, RingAllocator, MAX_MACHINES,
    MAX_OWNER_PER_PROCESS, MAX_PROCESS_PER_MACHINE,
};

use crate::error::{AddressError, Result};

/// Mints MPOs and tracks which conversation owns each live simulation.
///
/// The MPO ↔ conversation mapping is exactly one-to-one between
/// [`new_owner`](Self::new_owner) and [`release`](Self::release).
#[derive(Debug)]
pub struct MpoManager {
    machines: RingAllocator,
    processes: HashMap<MachineId, RingAllocator>,
    owners: HashMap<Mp, RingAllocator>,
    by_conversation: HashMap<ConversationId, Mpo>,
    by_mpo: HashMap<Mpo, ConversationId>,
}

impl MpoManager {
    /// Create a manager with every slot free.
    pub fn new() -> Self {
        Self {
            machines: RingAllocator::new(MAX_MACHINES),
            processes: HashMap::new(),
            owners: HashMap::new(),
            by_conversation: HashMap::new(),
            by_mpo: HashMap::new(),
        }
    }

    /// Enroll a daemon: allocate a machine slot.
    pub fn new_daemon(&mut self) -> Result<Mpo> {
        let machine = MachineId::new(self.machines.allocate()? as u8);
        self.processes
            .insert(machine, RingAllocator::new(MAX_PROCESS_PER_MACHINE));
        let mpo = Mpo::new(machine, ProcessId::new(0), OwnerId::new(0));
        info!(%machine, "daemon enrolled");
        Ok(mpo)
    }

    /// Tear down a daemon: reclaim its machine slot and everything under it.
    pub fn daemon_disconnect(&mut self, daemon: Mpo) -> Result<()> {
        let machine = daemon.machine();
        if self.processes.remove(&machine).is_none() {
            return Err(AddressError::UnknownMachine(machine));
        }
        self.owners.retain(|mp, _| mp.machine() != machine);
        let doomed: Vec<(Mpo, ConversationId)> = self
            .by_mpo
            .iter()
            .filter(|(mpo, _)| mpo.machine() == machine)
            .map(|(mpo, conversation)| (*mpo, *conversation))
            .collect();
        for (mpo, conversation) in doomed {
            self.by_mpo.remove(&mpo);
            self.by_conversation.remove(&conversation);
        }
        self.machines.free(machine.value() as u16);
        info!(%machine, "daemon disconnected");
        Ok(())
    }

    /// Enroll a leaf under a daemon: allocate a process slot.
    pub fn new_leaf(&mut self, daemon: Mpo) -> Result<Mpo> {
        let machine = daemon.machine();
        let ring = self
            .processes
            .get_mut(&machine)
            .ok_or(AddressError::UnknownMachine(machine))?;
        let process = ProcessId::new(ring.allocate()? as u8);
        let mpo = Mpo::new(machine, process, OwnerId::new(0));
        self.owners
            .insert(mpo.mp(), RingAllocator::new(MAX_OWNER_PER_PROCESS));
        info!(mp = %mpo.mp(), "leaf enrolled");
        Ok(mpo)
    }

    /// Tear down a leaf: reclaim its process slot and the owners under it.
    pub fn leaf_disconnected(&mut self, leaf: Mpo) -> Result<()> {
        let mp = leaf.mp();
        if self.owners.remove(&mp).is_none() {
            return Err(AddressError::UnknownProcess(mp));
        }
        let doomed: Vec<(Mpo, ConversationId)> = self
            .by_mpo
            .iter()
            .filter(|(mpo, _)| mpo.mp() == mp)
            .map(|(mpo, conversation)| (*mpo, *conversation))
            .collect();
        for (mpo, conversation) in doomed {
            self.by_mpo.remove(&mpo);
            self.by_conversation.remove(&conversation);
        }
        if let Some(ring) = self.processes.get_mut(&mp.machine()) {
            ring.free(mp.process().value() as u16);
        }
        info!(%mp, "leaf disconnected");
        Ok(())
    }

    /// Start a simulation under a leaf: allocate an owner slot and bind it
    /// to the driving conversation.
    pub fn new_owner(&mut self, leaf: Mpo, conversation: ConversationId) -> Result<Mpo> {
        let mp = leaf.mp();
        let ring = self
            .owners
            .get_mut(&mp)
            .ok_or(AddressError::UnknownProcess(mp))?;
        let owner = OwnerId::new(ring.allocate()?);
        let mpo = Mpo::new(mp.machine(), mp.process(), owner);
        debug_assert!(!self.by_conversation.contains_key(&conversation));
        self.by_conversation.insert(conversation, mpo);
        self.by_mpo.insert(mpo, conversation);
        debug!(%mpo, %conversation, "simulation registered");
        Ok(mpo)
    }

    /// End a simulation: unbind its conversation and reclaim the owner slot.
    pub fn release(&mut self, conversation: ConversationId) -> Result<Mpo> {
        let mpo = self
            .by_conversation
            .remove(&conversation)
            .ok_or(AddressError::UnknownConversation(conversation))?;
        self.by_mpo.remove(&mpo);
        if let Some(ring) = self.owners.get_mut(&mpo.mp()) {
            ring.free(mpo.owner().value());
        }
        debug!(%mpo, %conversation, "simulation released");
        Ok(mpo)
    }

    /// The conversation driving a live simulation.
    pub fn conversation_of(&self, mpo: Mpo) -> Result<ConversationId> {
        self.by_mpo
            .get(&mpo)
            .copied()
            .ok_or(AddressError::UnknownMpo(mpo))
    }

    /// The simulation a conversation is driving.
    pub fn mpo_of(&self, conversation: ConversationId) -> Result<Mpo> {
        self.by_conversation
            .get(&conversation)
            .copied()
            .ok_or(AddressError::UnknownConversation(conversation))
    }

    /// Enrolled machine identifiers, ascending.
    pub fn machines(&self) -> Vec<MachineId> {
        self.machines
            .allocated()
            .into_iter()
            .map(|slot| MachineId::new(slot as u8))
            .collect()
    }

    /// Enrolled leaf processes under a machine, ascending.
    pub fn processes(&self, machine: MachineId) -> Result<Vec<Mp>> {
        let ring = self
            .processes
            .get(&machine)
            .ok_or(AddressError::UnknownMachine(machine))?;
        Ok(ring
            .allocated()
            .into_iter()
            .map(|slot| Mp::new(machine, ProcessId::new(slot as u8)))
            .collect())
    }

    /// Live simulations under a leaf process, ascending.
    pub fn mpos(&self, mp: Mp) -> Result<Vec<Mpo>> {
        let ring = self
            .owners
            .get(&mp)
            .ok_or(AddressError::UnknownProcess(mp))?;
        Ok(ring
            .allocated()
            .into_iter()
            .map(|slot| Mpo::new(mp.machine(), mp.process(), OwnerId::new(slot)))
            .collect())
    }
}

impl Default for MpoManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_hierarchically_and_reuses_owner_slots() {
        let mut mgr = MpoManager::new();
        let daemon = mgr.new_daemon().unwrap();
        assert_eq!(daemon.to_string(), "0.0.0");

        let leaf = mgr.new_leaf(daemon).unwrap();
        assert_eq!(leaf.to_string(), "0.0.0");

        let conv_a = ConversationId::new();
        let a = mgr.new_owner(leaf, conv_a).unwrap();
        assert_eq!(a.owner(), OwnerId::new(0));

        assert_eq!(mgr.release(conv_a).unwrap(), a);

        let conv_b = ConversationId::new();
        let b = mgr.new_owner(leaf, conv_b).unwrap();
        assert_eq!(b.owner(), OwnerId::new(0));
    }

    #[test]
    fn mapping_is_bijective_while_live() {
        let mut mgr = MpoManager::new();
        let daemon = mgr.new_daemon().unwrap();
        let leaf = mgr.new_leaf(daemon).unwrap();
        let conv = ConversationId::new();
        let mpo = mgr.new_owner(leaf, conv).unwrap();

        assert_eq!(mgr.mpo_of(conv).unwrap(), mpo);
        assert_eq!(mgr.conversation_of(mpo).unwrap(), conv);

        mgr.release(conv).unwrap();
        assert_eq!(mgr.mpo_of(conv), Err(AddressError::UnknownConversation(conv)));
        assert_eq!(mgr.conversation_of(mpo), Err(AddressError::UnknownMpo(mpo)));
    }

    #[test]
    fn second_leaf_gets_the_next_process_slot() {
        let mut mgr = MpoManager::new();
        let daemon = mgr.new_daemon().unwrap();
        let first = mgr.new_leaf(daemon).unwrap();
        let second = mgr.new_leaf(daemon).unwrap();
        assert_eq!(first.process(), ProcessId::new(0));
        assert_eq!(second.process(), ProcessId::new(1));
    }

    #[test]
    fn daemon_disconnect_cascades() {
        let mut mgr = MpoManager::new();
        let daemon = mgr.new_daemon().unwrap();
        let leaf = mgr.new_leaf(daemon).unwrap();
        let conv = ConversationId::new();
        let mpo = mgr.new_owner(leaf, conv).unwrap();

        mgr.daemon_disconnect(daemon).unwrap();

        assert_eq!(mgr.conversation_of(mpo), Err(AddressError::UnknownMpo(mpo)));
        assert_eq!(mgr.mpo_of(conv), Err(AddressError::UnknownConversation(conv)));
        assert_eq!(
            mgr.new_leaf(daemon),
            Err(AddressError::UnknownMachine(daemon.machine()))
        );

        // the machine slot is reusable for the next daemon
        let next = mgr.new_daemon().unwrap();
        assert_eq!(next.machine(), daemon.machine());
    }

    #[test]
    fn leaf_disconnect_reclaims_owners_only_under_it() {
        let mut mgr = MpoManager::new();
        let daemon = mgr.new_daemon().unwrap();
        let leaf_a = mgr.new_leaf(daemon).unwrap();
        let leaf_b = mgr.new_leaf(daemon).unwrap();
        let conv_a = ConversationId::new();
        let conv_b = ConversationId::new();
        let mpo_a = mgr.new_owner(leaf_a, conv_a).unwrap();
        let mpo_b = mgr.new_owner(leaf_b, conv_b).unwrap();

        mgr.leaf_disconnected(leaf_a).unwrap();

        assert_eq!(mgr.conversation_of(mpo_a), Err(AddressError::UnknownMpo(mpo_a)));
        assert_eq!(mgr.conversation_of(mpo_b).unwrap(), conv_b);
        // leaf_a's process slot is free again
        let leaf_c = mgr.new_leaf(daemon).unwrap();
        assert_eq!(leaf_c.process(), leaf_a.process());
    }

    #[test]
    fn enrole_queries_report_the_live_tree() {
        let mut mgr = MpoManager::new();
        let daemon = mgr.new_daemon().unwrap();
        let leaf = mgr.new_leaf(daemon).unwrap();
        let conv = ConversationId::new();
        let mpo = mgr.new_owner(leaf, conv).unwrap();

        assert_eq!(mgr.machines(), vec![daemon.machine()]);
        assert_eq!(mgr.processes(daemon.machine()).unwrap(), vec![leaf.mp()]);
        assert_eq!(mgr.mpos(leaf.mp()).unwrap(), vec![mpo]);
    }

    #[test]
    fn owner_slots_exhaust_at_capacity() {
        let mut mgr = MpoManager::new();
        let daemon = mgr.new_daemon().unwrap();
        let leaf = mgr.new_leaf(daemon).unwrap();
        for _ in 0..MAX_OWNER_PER_PROCESS {
            mgr.new_owner(leaf, ConversationId::new()).unwrap();
        }
        let err = mgr.new_owner(leaf, ConversationId::new()).unwrap_err();
        assert!(matches!(err, AddressError::Capacity(_)));
    }
}
