//! Request envelopes and task handles.
//!
//! Every task in the mesh - root, daemons, leaves, simulation hosts -
//! owns one mpsc receiver and is addressed through a cloneable handle
//! wrapping the sender. Requests that expect an answer carry a oneshot
//! reply channel; routing hops forward the envelope and the answer
//! travels straight back to the requester.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use simmesh_ident::{
    ConversationId, MachineId, Mp, Mpo, NetworkAddress, Reference, TimeStamp, TypeId,
};
use simmesh_lock::{LockKind, SimMsg};

use crate::error::{Result, RuntimeError};
use crate::log::Transaction;

/// Answer to a lock-protocol request.
#[derive(Debug, Clone, Copy)]
pub struct LockAck {
    /// False when the target was draining and the request had no effect.
    pub granted: bool,
    /// The target's cycle count at the time of the ack.
    pub timestamp: TimeStamp,
}

/// One object image leaving its owning simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    /// The owner's stored heap form for the object.
    pub reference: Reference,
    /// Payload bytes as of `timestamp`.
    pub image: Bytes,
    /// Cycle at which the image was current.
    pub timestamp: TimeStamp,
}

/// Requests served by one simulation's host task.
#[derive(Debug)]
pub enum SimRequest {
    /// A lock-protocol message. The ack returns through `reply` when the
    /// state machine surfaces it; a write release carries the writer's
    /// transaction, applied before the ack is sent.
    Lock {
        msg: SimMsg,
        transaction: Option<Transaction>,
        reply: Option<oneshot::Sender<Result<LockAck>>>,
    },
    /// Read the current image of an object this simulation owns.
    Snapshot {
        address: NetworkAddress,
        reply: oneshot::Sender<Result<ObjectSnapshot>>,
    },
    /// Allocate and construct an object this simulation will own,
    /// answered in network form.
    Allocate {
        type_id: TypeId,
        reply: oneshot::Sender<Result<Reference>>,
    },
}

impl SimRequest {
    /// Answer the requester with `err` when the envelope cannot be
    /// delivered or served.
    pub fn reject(self, err: RuntimeError) {
        match self {
            Self::Lock {
                reply: Some(reply), ..
            } => {
                let _ = reply.send(Err(err));
            }
            Self::Lock { reply: None, .. } => {}
            Self::Snapshot { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Allocate { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Requests served by the root task.
#[derive(Debug)]
pub enum RootRequest {
    /// Enrole a machine: bind its daemon handle to a fresh machine slot.
    EnroleDaemon {
        daemon: DaemonHandle,
        reply: oneshot::Sender<Result<Mpo>>,
    },
    /// Remove a daemon and everything beneath it.
    DaemonDisconnect {
        daemon: Mpo,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Enrole a worker process under an enrolled daemon.
    EnroleLeaf {
        daemon: Mpo,
        reply: oneshot::Sender<Result<Mpo>>,
    },
    /// Remove a leaf and the simulations registered under it.
    LeafDisconnect {
        leaf: Mpo,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Create a simulation on the given leaf process and run it.
    SimCreate {
        mp: Mp,
        reply: oneshot::Sender<Result<Mpo>>,
    },
    /// A finished simulation handing back its slot and addresses.
    SimStopped { mpo: Mpo },
    /// Route a request toward the simulation that owns `target`.
    MpoUp { target: Mpo, request: SimRequest },
    /// Mint a network address owned by `mpo`.
    AllocateAddress {
        mpo: Mpo,
        type_id: TypeId,
        reply: oneshot::Sender<Result<NetworkAddress>>,
    },
    /// Return an address to the free-list.
    DeallocateAddress {
        mpo: Mpo,
        address: NetworkAddress,
        reply: oneshot::Sender<Result<()>>,
    },
    /// The simulation currently owning an address.
    AddressOwner {
        address: NetworkAddress,
        reply: oneshot::Sender<Result<Mpo>>,
    },
    /// The root object address of a simulation.
    RootAddress {
        mpo: Mpo,
        reply: oneshot::Sender<Result<NetworkAddress>>,
    },
    /// Enrolled machines, ascending.
    Machines {
        reply: oneshot::Sender<Result<Vec<MachineId>>>,
    },
    /// Enrolled leaf processes under a machine.
    Processes {
        machine: MachineId,
        reply: oneshot::Sender<Result<Vec<Mp>>>,
    },
    /// Live simulations under a leaf process.
    Mpos {
        mp: Mp,
        reply: oneshot::Sender<Result<Vec<Mpo>>>,
    },
    /// Store a build artifact in the root stash.
    Stash {
        key: String,
        determinant: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Fetch a build artifact if its determinant still matches.
    Restore {
        key: String,
        determinant: u64,
        reply: oneshot::Sender<Result<Option<Bytes>>>,
    },
    /// Drop every stashed artifact.
    StashClear { reply: oneshot::Sender<Result<()>> },
}

impl RootRequest {
    pub fn enrole_daemon(daemon: DaemonHandle) -> (Self, oneshot::Receiver<Result<Mpo>>) {
        let (reply, rx) = oneshot::channel();
        (Self::EnroleDaemon { daemon, reply }, rx)
    }

    pub fn daemon_disconnect(daemon: Mpo) -> (Self, oneshot::Receiver<Result<()>>) {
        let (reply, rx) = oneshot::channel();
        (Self::DaemonDisconnect { daemon, reply }, rx)
    }

    pub fn enrole_leaf(daemon: Mpo) -> (Self, oneshot::Receiver<Result<Mpo>>) {
        let (reply, rx) = oneshot::channel();
        (Self::EnroleLeaf { daemon, reply }, rx)
    }

    pub fn leaf_disconnect(leaf: Mpo) -> (Self, oneshot::Receiver<Result<()>>) {
        let (reply, rx) = oneshot::channel();
        (Self::LeafDisconnect { leaf, reply }, rx)
    }

    pub fn sim_create(mp: Mp) -> (Self, oneshot::Receiver<Result<Mpo>>) {
        let (reply, rx) = oneshot::channel();
        (Self::SimCreate { mp, reply }, rx)
    }

    pub fn allocate_address(
        mpo: Mpo,
        type_id: TypeId,
    ) -> (Self, oneshot::Receiver<Result<NetworkAddress>>) {
        let (reply, rx) = oneshot::channel();
        (Self::AllocateAddress { mpo, type_id, reply }, rx)
    }

    pub fn deallocate_address(
        mpo: Mpo,
        address: NetworkAddress,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (reply, rx) = oneshot::channel();
        (Self::DeallocateAddress { mpo, address, reply }, rx)
    }

    pub fn address_owner(address: NetworkAddress) -> (Self, oneshot::Receiver<Result<Mpo>>) {
        let (reply, rx) = oneshot::channel();
        (Self::AddressOwner { address, reply }, rx)
    }

    pub fn root_address(mpo: Mpo) -> (Self, oneshot::Receiver<Result<NetworkAddress>>) {
        let (reply, rx) = oneshot::channel();
        (Self::RootAddress { mpo, reply }, rx)
    }

    pub fn machines() -> (Self, oneshot::Receiver<Result<Vec<MachineId>>>) {
        let (reply, rx) = oneshot::channel();
        (Self::Machines { reply }, rx)
    }

    pub fn processes(machine: MachineId) -> (Self, oneshot::Receiver<Result<Vec<Mp>>>) {
        let (reply, rx) = oneshot::channel();
        (Self::Processes { machine, reply }, rx)
    }

    pub fn mpos(mp: Mp) -> (Self, oneshot::Receiver<Result<Vec<Mpo>>>) {
        let (reply, rx) = oneshot::channel();
        (Self::Mpos { mp, reply }, rx)
    }

    pub fn stash(
        key: impl Into<String>,
        determinant: u64,
        data: Bytes,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self::Stash {
                key: key.into(),
                determinant,
                data,
                reply,
            },
            rx,
        )
    }

    pub fn restore(
        key: impl Into<String>,
        determinant: u64,
    ) -> (Self, oneshot::Receiver<Result<Option<Bytes>>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self::Restore {
                key: key.into(),
                determinant,
                reply,
            },
            rx,
        )
    }

    pub fn stash_clear() -> (Self, oneshot::Receiver<Result<()>>) {
        let (reply, rx) = oneshot::channel();
        (Self::StashClear { reply }, rx)
    }
}

/// Requests served by a daemon task.
#[derive(Debug)]
pub enum DaemonRequest {
    /// Enrole a worker process on this machine.
    EnroleLeaf {
        leaf: LeafHandle,
        reply: oneshot::Sender<Result<Mpo>>,
    },
    /// Remove a leaf from this machine.
    LeafDisconnect {
        leaf: Mpo,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Run a freshly created simulation on one of this machine's leaves.
    RunSimulation {
        mpo: Mpo,
        conversation: ConversationId,
        root_address: NetworkAddress,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Route upward from a leaf toward `target`'s owner; same-machine
    /// targets turn straight back down.
    MpoUp { target: Mpo, request: SimRequest },
    /// Route downward to a leaf on this machine.
    MpoDown { target: Mpo, request: SimRequest },
    /// Forward a request to the root.
    MpRoot { request: RootRequest },
    /// A simulation somewhere in the mesh was destroyed.
    MpoDestroyed { mpo: Mpo },
    /// Stop this daemon and the leaves beneath it.
    Shutdown,
}

/// Requests served by a leaf task.
#[derive(Debug)]
pub enum LeafRequest {
    /// Host a freshly created simulation on this process.
    RunSimulation {
        mpo: Mpo,
        conversation: ConversationId,
        root_address: NetworkAddress,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Route upward on behalf of a hosted simulation; targets hosted
    /// here are delivered without leaving the process.
    MpoUp { target: Mpo, request: SimRequest },
    /// Route downward to a simulation hosted here.
    MpoDown { target: Mpo, request: SimRequest },
    /// Forward a request to the root.
    MpRoot { request: RootRequest },
    /// A hosted simulation observed a destroy and is draining.
    SimulationTerminating { mpo: Mpo },
    /// A hosted simulation finished and released its memory.
    SimulationStopped { mpo: Mpo },
    /// A simulation somewhere in the mesh was destroyed.
    MpoDestroyed { mpo: Mpo },
    /// Stop this leaf and the simulations it hosts.
    Shutdown,
}

/// Await a routed reply, mapping a dropped channel to the transport
/// error.
pub(crate) async fn await_reply<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await.map_err(|_| RuntimeError::ChannelClosed)?
}

/// Handle to the root task.
#[derive(Debug, Clone)]
pub struct RootHandle {
    tx: mpsc::Sender<RootRequest>,
}

impl RootHandle {
    pub(crate) fn new(tx: mpsc::Sender<RootRequest>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, request: RootRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Send a paired request and await its reply.
    pub async fn request<T>(
        &self,
        (request, rx): (RootRequest, oneshot::Receiver<Result<T>>),
    ) -> Result<T> {
        self.send(request).await?;
        await_reply(rx).await
    }
}

/// Handle to one machine's daemon task.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<DaemonRequest>,
}

impl DaemonHandle {
    pub(crate) fn new(tx: mpsc::Sender<DaemonRequest>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, request: DaemonRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}

/// Handle to one process's leaf task.
#[derive(Debug, Clone)]
pub struct LeafHandle {
    tx: mpsc::Sender<LeafRequest>,
}

impl LeafHandle {
    pub(crate) fn new(tx: mpsc::Sender<LeafRequest>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, request: LeafRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Send a lock-protocol message toward `target` and await the ack.
    pub async fn lock(
        &self,
        target: Mpo,
        msg: SimMsg,
        transaction: Option<Transaction>,
    ) -> Result<LockAck> {
        let (reply, rx) = oneshot::channel();
        self.send(LeafRequest::MpoUp {
            target,
            request: SimRequest::Lock {
                msg,
                transaction,
                reply: Some(reply),
            },
        })
        .await?;
        await_reply(rx).await
    }

    /// Fetch the owner's current image of the object at `address`.
    pub async fn snapshot(&self, owner: Mpo, address: NetworkAddress) -> Result<ObjectSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(LeafRequest::MpoUp {
            target: owner,
            request: SimRequest::Snapshot { address, reply },
        })
        .await?;
        await_reply(rx).await
    }

    /// Ask `target` to allocate and construct an object it will own.
    pub async fn allocate_remote(&self, target: Mpo, type_id: TypeId) -> Result<Reference> {
        let (reply, rx) = oneshot::channel();
        self.send(LeafRequest::MpoUp {
            target,
            request: SimRequest::Allocate { type_id, reply },
        })
        .await?;
        await_reply(rx).await
    }

    /// Send a paired root request via this leaf's routing and await its
    /// reply.
    pub async fn root_request<T>(
        &self,
        (request, rx): (RootRequest, oneshot::Receiver<Result<T>>),
    ) -> Result<T> {
        self.send(LeafRequest::MpRoot { request }).await?;
        await_reply(rx).await
    }
}

/// Handle to one hosted simulation.
#[derive(Debug, Clone)]
pub struct SimHandle {
    mpo: Mpo,
    tx: mpsc::Sender<SimRequest>,
}

impl SimHandle {
    pub(crate) fn new(mpo: Mpo, tx: mpsc::Sender<SimRequest>) -> Self {
        Self { mpo, tx }
    }

    pub fn mpo(&self) -> Mpo {
        self.mpo
    }

    pub async fn send(&self, request: SimRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}

/// Build an externally driven destroy message under a fresh
/// conversation.
pub fn destroy_msg() -> SimMsg {
    SimMsg::new(LockKind::Destroy, ConversationId::new())
}
