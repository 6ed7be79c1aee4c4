//! The execution context a behavior runs against.
//!
//! One [`MpoContext`] belongs to one hosted simulation. It carries the
//! simulation's identity, its root reference, the handle to the leaf that
//! routes for it, the shared leaf memory, the requester-side lock
//! tracker, and the event log the cycle-complete sweep drains.
//!
//! Locking is suspension-based: a lock call sends one message toward the
//! target and suspends the logical thread until the ack arrives. At most
//! one lock request per simulation is ever outstanding.

use bytes::Bytes;
use tracing::{debug, warn};

use simmesh_ident::{
    ConversationId, HeapRef, MachineId, Mp, Mpo, Reference, TimeStamp, TypeId, TypeInstance,
    ROOT_TYPE_ID,
};
use simmesh_lock::{LockKind, LockTracker, SimMsg};
use simmesh_memory::{lock_memory, LeafMemoryHandle, MemoryError};

use crate::envelope::{LeafHandle, RootRequest};
use crate::error::{Result, RuntimeError};
use crate::log::{EventLog, SchedulingAction, SchedulingRecord};

/// Per-simulation execution context.
pub struct MpoContext {
    mpo: Mpo,
    conversation: ConversationId,
    root: Reference,
    leaf: LeafHandle,
    memory: LeafMemoryHandle,
    log: EventLog,
    tracker: LockTracker,
    inbox: Vec<SchedulingRecord>,
    now: TimeStamp,
    finished: bool,
}

impl MpoContext {
    pub(crate) fn new(
        mpo: Mpo,
        conversation: ConversationId,
        root: Reference,
        leaf: LeafHandle,
        memory: LeafMemoryHandle,
    ) -> Self {
        Self {
            mpo,
            conversation,
            root,
            leaf,
            memory,
            log: EventLog::new(),
            tracker: LockTracker::new(),
            inbox: Vec::new(),
            now: TimeStamp::FIRST,
            finished: false,
        }
    }

    /// This simulation's identity.
    pub fn mpo(&self) -> Mpo {
        self.mpo
    }

    /// The conversation driving this simulation.
    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// This simulation's root object, in heap form.
    pub fn root(&self) -> Reference {
        self.root
    }

    /// The current cycle.
    pub fn now(&self) -> TimeStamp {
        self.now
    }

    pub(crate) fn set_now(&mut self, now: TimeStamp) {
        self.now = now;
    }

    pub(crate) fn memory(&self) -> &LeafMemoryHandle {
        &self.memory
    }

    /// Mark this simulation finished; its host terminates it after the
    /// current cycle completes.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub(crate) fn take_finished(&mut self) -> bool {
        std::mem::take(&mut self.finished)
    }

    pub(crate) fn deliver_scheduling(&mut self, records: Vec<SchedulingRecord>) {
        self.inbox.extend(records);
    }

    /// Scheduling records other simulations delivered here, in arrival
    /// order. Draining hands them to the behavior exactly once.
    pub fn take_scheduled(&mut self) -> Vec<SchedulingRecord> {
        std::mem::take(&mut self.inbox)
    }

    /// Take a read lock on `target` for the rest of this cycle and
    /// return the grant timestamp. Reading your own state needs no lock;
    /// a grant already held this cycle is reused without a round trip.
    pub async fn read_lock(&mut self, target: Mpo) -> Result<TimeStamp> {
        if target == self.mpo {
            return Ok(self.now);
        }
        if let Some(stamp) = self.tracker.stamp_of(target) {
            return Ok(stamp);
        }
        let ack = self
            .leaf
            .lock(
                target,
                SimMsg::new(LockKind::Read(self.mpo), self.conversation),
                None,
            )
            .await?;
        if !ack.granted {
            return Err(RuntimeError::Terminating(target));
        }
        self.tracker.on_read(target, ack.timestamp);
        Ok(ack.timestamp)
    }

    /// Take the write lock on `target` for the rest of this cycle and
    /// return the grant timestamp. A held read promotes in place.
    pub async fn write_lock(&mut self, target: Mpo) -> Result<TimeStamp> {
        if target == self.mpo {
            return Ok(self.now);
        }
        if self.tracker.is_write(target) {
            if let Some(stamp) = self.tracker.stamp_of(target) {
                return Ok(stamp);
            }
        }
        let ack = self
            .leaf
            .lock(
                target,
                SimMsg::new(LockKind::Write(self.mpo), self.conversation),
                None,
            )
            .await?;
        if !ack.granted {
            return Err(RuntimeError::Terminating(target));
        }
        self.tracker.on_write(target, ack.timestamp);
        Ok(ack.timestamp)
    }

    /// Close the cycle: drain the event log into per-target transactions
    /// and release every held grant, writes first so their transactions
    /// land before any reader resumes.
    pub async fn cycle_complete(&mut self) -> Result<()> {
        let records = self.log.drain_cycle(self.mpo);

        let writes: Vec<Mpo> = self.tracker.writes().map(|(mpo, _)| mpo).collect();
        let reads: Vec<Mpo> = self.tracker.reads().map(|(mpo, _)| mpo).collect();

        for target in records.targets() {
            if !self.tracker.is_write(target) {
                warn!(
                    %target,
                    "records for a simulation not write-locked this cycle, dropped"
                );
            }
        }

        for target in writes {
            let transaction = records.transaction_for(target);
            let ack = self
                .leaf
                .lock(
                    target,
                    SimMsg::new(LockKind::Release(self.mpo), self.conversation),
                    Some(transaction),
                )
                .await?;
            debug!(%target, granted = ack.granted, "write released");
        }
        for target in reads {
            self.leaf
                .lock(
                    target,
                    SimMsg::new(LockKind::Release(self.mpo), self.conversation),
                    None,
                )
                .await?;
        }
        self.tracker.reset();
        Ok(())
    }

    /// Resolve `reference` into a fresh local heap form valid under the
    /// grant taken at `lock_cycle`.
    ///
    /// A heap form already stamped with `lock_cycle` is a no-op. A known
    /// object is restamped, refreshing its mirrored payload when it is
    /// stale relative to the grant. An unknown network form is resolved
    /// through the root's ownership table, mirrored from the owner's
    /// snapshot, and stamped.
    pub async fn network_to_heap(
        &mut self,
        reference: Reference,
        lock_cycle: TimeStamp,
    ) -> Result<Reference> {
        match reference {
            Reference::Heap(r) if r.lock_cycle == lock_cycle => Ok(reference),
            Reference::Heap(_) => self.refresh(reference, lock_cycle).await,
            Reference::Network(net) => {
                let known = { lock_memory(&self.memory)?.try_network_to_heap(net) };
                match known {
                    Some(local) => self.refresh(local, lock_cycle).await,
                    None => {
                        let owner = self
                            .leaf
                            .root_request(RootRequest::address_owner(net.address))
                            .await?;
                        if owner == self.mpo {
                            // our own objects are constructed before any
                            // reference to them can circulate
                            return Err(MemoryError::UnknownObject(reference).into());
                        }
                        let snapshot = self.leaf.snapshot(owner, net.address).await?;
                        let remote = match snapshot.reference.as_heap() {
                            Some(stored) => HeapRef {
                                type_instance: net.type_instance,
                                ..*stored
                            },
                            None => {
                                return Err(MemoryError::WrongForm {
                                    expected: "heap",
                                    reference: snapshot.reference,
                                }
                                .into())
                            }
                        };
                        let local = {
                            let mut memory = lock_memory(&self.memory)?;
                            let local = memory.attach_remote(remote, net.address)?;
                            memory.write_object(&local, &snapshot.image, snapshot.timestamp)?;
                            local
                        };
                        debug!(reference = %local, owner = %owner, "mirrored remote object");
                        Ok(local.with_lock_cycle(lock_cycle))
                    }
                }
            }
        }
    }

    /// Restamp a known heap form, refreshing a mirrored payload that is
    /// older than the grant.
    async fn refresh(&mut self, local: Reference, lock_cycle: TimeStamp) -> Result<Reference> {
        if let Some(owner) = local.mpo() {
            if owner != self.mpo {
                let (stale, address) = {
                    let mut memory = lock_memory(&self.memory)?;
                    let stamp = memory.timestamp_of(&local)?;
                    let address = memory.heap_to_network(&local)?.address;
                    (stamp < lock_cycle, address)
                };
                if stale {
                    let snapshot = self.leaf.snapshot(owner, address).await?;
                    lock_memory(&self.memory)?.write_object(
                        &local,
                        &snapshot.image,
                        snapshot.timestamp,
                    )?;
                }
            }
        }
        Ok(local.with_lock_cycle(lock_cycle))
    }

    /// Re-derive the location-independent form of a reference.
    pub fn network_form(&mut self, reference: &Reference) -> Result<Reference> {
        let net = lock_memory(&self.memory)?.heap_to_network(reference)?;
        Ok(Reference::Network(net))
    }

    /// Copy of the object's payload bytes.
    pub fn read_bytes(&mut self, reference: &Reference) -> Result<Bytes> {
        let (image, _) = lock_memory(&self.memory)?.read_object(reference)?;
        Ok(image)
    }

    /// Write the object's payload and record the write for the release
    /// transaction of its owner.
    pub fn write_bytes(&mut self, reference: &Reference, image: Bytes) -> Result<()> {
        lock_memory(&self.memory)?.write_object(reference, &image, self.now)?;
        self.log.record_memory(*reference, image);
        Ok(())
    }

    /// Record a scheduling event for the referenced object's owner,
    /// delivered with this cycle's release transaction.
    pub fn schedule(&mut self, reference: Reference, action: SchedulingAction) {
        self.log.record_scheduling(reference, action);
    }

    /// Allocate and construct an object owned by this simulation,
    /// returned in heap form.
    pub async fn allocate(&mut self, type_id: TypeId) -> Result<Reference> {
        let address = self
            .leaf
            .root_request(RootRequest::allocate_address(self.mpo, type_id))
            .await?;
        let reference = lock_memory(&self.memory)?.construct_object(
            self.mpo,
            TypeInstance::object(type_id),
            address,
        )?;
        Ok(reference)
    }

    /// Ask `target` to allocate and construct an object it will own,
    /// returned in network form.
    pub async fn allocate_remote(&mut self, target: Mpo, type_id: TypeId) -> Result<Reference> {
        if target == self.mpo {
            let local = self.allocate(type_id).await?;
            return self.network_form(&local);
        }
        self.leaf.allocate_remote(target, type_id).await
    }

    /// Create and run a new simulation on `mp`, returning its identity
    /// once it is live.
    pub async fn construct_mpo(&mut self, mp: Mp) -> Result<Mpo> {
        self.leaf.root_request(RootRequest::sim_create(mp)).await
    }

    /// Ask `target` to terminate; resolves once its machine acknowledges
    /// the destroy.
    pub async fn destroy(&mut self, target: Mpo) -> Result<()> {
        if target == self.mpo {
            self.finish();
            return Ok(());
        }
        self.leaf
            .lock(
                target,
                SimMsg::new(LockKind::Destroy, self.conversation),
                None,
            )
            .await?;
        Ok(())
    }

    /// The root object of `mpo`, in network form for remote simulations
    /// and heap form for this one.
    pub async fn get_root(&mut self, mpo: Mpo) -> Result<Reference> {
        if mpo == self.mpo {
            return Ok(self.root);
        }
        let address = self
            .leaf
            .root_request(RootRequest::root_address(mpo))
            .await?;
        Ok(Reference::network(
            TypeInstance::object(ROOT_TYPE_ID),
            address,
        ))
    }

    /// Enrolled machines, ascending.
    pub async fn machines(&mut self) -> Result<Vec<MachineId>> {
        self.leaf.root_request(RootRequest::machines()).await
    }

    /// Enrolled leaf processes under `machine`, ascending.
    pub async fn processes(&mut self, machine: MachineId) -> Result<Vec<Mp>> {
        self.leaf.root_request(RootRequest::processes(machine)).await
    }

    /// Live simulations under `mp`, ascending.
    pub async fn simulations(&mut self, mp: Mp) -> Result<Vec<Mpo>> {
        self.leaf.root_request(RootRequest::mpos(mp)).await
    }

    /// Store a build artifact in the root stash.
    pub async fn stash(&mut self, key: &str, determinant: u64, data: Bytes) -> Result<()> {
        self.leaf
            .root_request(RootRequest::stash(key, determinant, data))
            .await
    }

    /// Fetch a build artifact if its determinant still matches.
    pub async fn restore(&mut self, key: &str, determinant: u64) -> Result<Option<Bytes>> {
        self.leaf
            .root_request(RootRequest::restore(key, determinant))
            .await
    }
}

impl std::fmt::Debug for MpoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpoContext")
            .field("mpo", &self.mpo)
            .field("conversation", &self.conversation)
            .field("now", &self.now)
            .field("pending_records", &self.log.pending())
            .finish()
    }
}
