//! Root, daemon and leaf tasks, and the mesh front.
//!
//! The mesh is a tree: one root task owns the identity and address
//! tables, one daemon task per machine routes between its leaves and
//! the root, one leaf task per worker process hosts simulations against
//! the process's shared memory. Requests climb the tree only as far as
//! they must; a target on the same leaf never leaves the process.
//!
//! The root's loop is synchronous: every downward hop is a detached
//! send, so no task in the tree ever waits on a descendant.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use simmesh_address::{AddressSpace, MpoManager};
use simmesh_ident::{ConversationId, MachineId, Mp, Mpo, OwnerId, ROOT_TYPE_ID};
use simmesh_memory::{
    lock_memory, CodeProvider, LeafMemory, LeafMemoryHandle, LocalSegmentNames, SegmentRegistry,
};

use crate::config::NetworkConfig;
use crate::envelope::{
    await_reply, destroy_msg, DaemonHandle, DaemonRequest, LeafHandle, LeafRequest, RootHandle,
    RootRequest, SimHandle, SimRequest,
};
use crate::error::{Result, RuntimeError};
use crate::simulation::{BehaviorFactory, SimulationHost};
use crate::stash::{MemoryStash, Stash};

/// The management task at the top of the tree.
struct RootTask {
    config: NetworkConfig,
    /// Self handle, for deferred bookkeeping sent from helper tasks.
    handle: RootHandle,
    manager: MpoManager,
    space: AddressSpace,
    stash: Box<dyn Stash>,
    daemons: HashMap<MachineId, DaemonHandle>,
    rx: mpsc::Receiver<RootRequest>,
}

impl RootTask {
    fn spawn(config: NetworkConfig, stash: Box<dyn Stash>) -> RootHandle {
        let (tx, rx) = mpsc::channel(config.channel_depth);
        let handle = RootHandle::new(tx);
        let task = Self {
            config,
            handle: handle.clone(),
            manager: MpoManager::new(),
            space: AddressSpace::new(),
            stash,
            daemons: HashMap::new(),
            rx,
        };
        tokio::spawn(task.run());
        handle
    }

    async fn run(mut self) {
        info!("root running");
        while let Some(request) = self.rx.recv().await {
            self.serve(request);
        }
        debug!("root stopped");
    }

    fn serve(&mut self, request: RootRequest) {
        match request {
            RootRequest::EnroleDaemon { daemon, reply } => {
                let result = self.manager.new_daemon().map_err(RuntimeError::from);
                if let Ok(mpo) = &result {
                    self.daemons.insert(mpo.machine(), daemon);
                }
                let _ = reply.send(result);
            }
            RootRequest::DaemonDisconnect { daemon, reply } => {
                let _ = reply.send(self.daemon_disconnect(daemon));
            }
            RootRequest::EnroleLeaf { daemon, reply } => {
                let _ = reply.send(self.manager.new_leaf(daemon).map_err(Into::into));
            }
            RootRequest::LeafDisconnect { leaf, reply } => {
                let _ = reply.send(self.leaf_disconnect(leaf));
            }
            RootRequest::SimCreate { mp, reply } => self.sim_create(mp, reply),
            RootRequest::SimStopped { mpo } => self.sim_stopped(mpo),
            RootRequest::MpoUp { target, request } => self.route(target, request),
            RootRequest::AllocateAddress { mpo, type_id, reply } => {
                let result = if self.space.owned() >= self.config.max_addresses {
                    Err(RuntimeError::AddressSpaceExhausted(self.config.max_addresses))
                } else if let Err(err) = self.manager.conversation_of(mpo) {
                    // only live simulations own addresses
                    Err(err.into())
                } else {
                    Ok(self.space.allocate(mpo, type_id))
                };
                let _ = reply.send(result);
            }
            RootRequest::DeallocateAddress { mpo, address, reply } => {
                let _ = reply.send(self.space.deallocate(mpo, address).map_err(Into::into));
            }
            RootRequest::AddressOwner { address, reply } => {
                let _ = reply.send(self.space.ownership(address).map_err(Into::into));
            }
            RootRequest::RootAddress { mpo, reply } => {
                let _ = reply.send(self.space.root_of(mpo).map_err(Into::into));
            }
            RootRequest::Machines { reply } => {
                let _ = reply.send(Ok(self.manager.machines()));
            }
            RootRequest::Processes { machine, reply } => {
                let _ = reply.send(self.manager.processes(machine).map_err(Into::into));
            }
            RootRequest::Mpos { mp, reply } => {
                let _ = reply.send(self.manager.mpos(mp).map_err(Into::into));
            }
            RootRequest::Stash {
                key,
                determinant,
                data,
                reply,
            } => {
                let _ = reply.send(self.stash.stash(&key, determinant, data));
            }
            RootRequest::Restore {
                key,
                determinant,
                reply,
            } => {
                let _ = reply.send(self.stash.restore(&key, determinant));
            }
            RootRequest::StashClear { reply } => {
                let _ = reply.send(self.stash.clear());
            }
        }
    }

    /// Mint the identity and root address for a new simulation and hand
    /// it to the target machine. The reply resolves once the leaf hosts
    /// it; a leaf-side failure undoes the bookkeeping.
    fn sim_create(&mut self, mp: Mp, reply: oneshot::Sender<Result<Mpo>>) {
        match self.start_simulation(mp) {
            Ok((mpo, daemon_rx)) => {
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    match await_reply(daemon_rx).await {
                        Ok(()) => {
                            let _ = reply.send(Ok(mpo));
                        }
                        Err(err) => {
                            let _ = handle.send(RootRequest::SimStopped { mpo }).await;
                            let _ = reply.send(Err(err));
                        }
                    }
                });
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn start_simulation(&mut self, mp: Mp) -> Result<(Mpo, oneshot::Receiver<Result<()>>)> {
        let daemon = self
            .daemons
            .get(&mp.machine())
            .cloned()
            .ok_or(RuntimeError::NoDaemon(mp.machine()))?;
        if self.space.owned() >= self.config.max_addresses {
            return Err(RuntimeError::AddressSpaceExhausted(self.config.max_addresses));
        }
        let leaf = Mpo::new(mp.machine(), mp.process(), OwnerId::new(0));
        let conversation = ConversationId::new();
        let mpo = self.manager.new_owner(leaf, conversation)?;
        let root_address = self.space.allocate(mpo, ROOT_TYPE_ID);
        self.space.set_root(mpo, root_address);

        let (daemon_reply, daemon_rx) = oneshot::channel();
        let request = DaemonRequest::RunSimulation {
            mpo,
            conversation,
            root_address,
            reply: daemon_reply,
        };
        tokio::spawn(async move {
            let _ = daemon.send(request).await;
        });
        info!(%mpo, %conversation, "simulation created");
        Ok((mpo, daemon_rx))
    }

    /// Reclaim everything a finished simulation held and tell every
    /// machine its slot is gone. Repeated stops for the same MPO are
    /// ignored.
    fn sim_stopped(&mut self, mpo: Mpo) {
        let Ok(conversation) = self.manager.conversation_of(mpo) else {
            debug!(%mpo, "stop for an unknown simulation ignored");
            return;
        };
        let _ = self.manager.release(conversation);
        self.space.clear_root(mpo);
        let swept = self.space.release_owned(mpo);
        self.space.defrag();
        info!(%mpo, swept, "simulation stopped");
        self.broadcast_destroyed(mpo);
    }

    fn leaf_disconnect(&mut self, leaf: Mpo) -> Result<()> {
        for mpo in self.manager.mpos(leaf.mp())? {
            self.space.clear_root(mpo);
            self.space.release_owned(mpo);
            self.broadcast_destroyed(mpo);
        }
        self.space.defrag();
        self.manager.leaf_disconnected(leaf)?;
        Ok(())
    }

    fn daemon_disconnect(&mut self, daemon: Mpo) -> Result<()> {
        let machine = daemon.machine();
        let processes = self.manager.processes(machine)?;
        self.daemons.remove(&machine);
        for mp in processes {
            for mpo in self.manager.mpos(mp)? {
                self.space.clear_root(mpo);
                self.space.release_owned(mpo);
                self.broadcast_destroyed(mpo);
            }
        }
        self.space.defrag();
        self.manager.daemon_disconnect(daemon)?;
        Ok(())
    }

    fn route(&self, target: Mpo, request: SimRequest) {
        match self.daemons.get(&target.machine()) {
            Some(daemon) => {
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    let _ = daemon.send(DaemonRequest::MpoDown { target, request }).await;
                });
            }
            None => request.reject(RuntimeError::NoDaemon(target.machine())),
        }
    }

    fn broadcast_destroyed(&self, mpo: Mpo) {
        for daemon in self.daemons.values() {
            let daemon = daemon.clone();
            tokio::spawn(async move {
                let _ = daemon.send(DaemonRequest::MpoDestroyed { mpo }).await;
            });
        }
    }
}

/// Per-machine routing task.
struct DaemonTask {
    mpo: Mpo,
    root: RootHandle,
    leaves: HashMap<Mp, LeafHandle>,
    rx: mpsc::Receiver<DaemonRequest>,
}

impl DaemonTask {
    async fn spawn(root: RootHandle, channel_depth: usize) -> Result<(Mpo, DaemonHandle)> {
        let (tx, rx) = mpsc::channel(channel_depth);
        let handle = DaemonHandle::new(tx);
        let mpo = root
            .request(RootRequest::enrole_daemon(handle.clone()))
            .await?;
        let task = Self {
            mpo,
            root,
            leaves: HashMap::new(),
            rx,
        };
        tokio::spawn(task.run());
        Ok((mpo, handle))
    }

    async fn run(mut self) {
        info!(daemon = %self.mpo, "daemon running");
        while let Some(request) = self.rx.recv().await {
            match request {
                DaemonRequest::EnroleLeaf { leaf, reply } => {
                    let result = self.root.request(RootRequest::enrole_leaf(self.mpo)).await;
                    if let Ok(mpo) = &result {
                        self.leaves.insert(mpo.mp(), leaf);
                    }
                    let _ = reply.send(result);
                }
                DaemonRequest::LeafDisconnect { leaf, reply } => {
                    self.leaves.remove(&leaf.mp());
                    let result = self.root.request(RootRequest::leaf_disconnect(leaf)).await;
                    let _ = reply.send(result);
                }
                DaemonRequest::RunSimulation {
                    mpo,
                    conversation,
                    root_address,
                    reply,
                } => match self.leaves.get(&mpo.mp()) {
                    Some(leaf) => {
                        let leaf = leaf.clone();
                        tokio::spawn(async move {
                            let _ = leaf
                                .send(LeafRequest::RunSimulation {
                                    mpo,
                                    conversation,
                                    root_address,
                                    reply,
                                })
                                .await;
                        });
                    }
                    None => {
                        let _ = reply.send(Err(RuntimeError::NoLeaf(mpo.mp())));
                    }
                },
                DaemonRequest::MpoUp { target, request } => {
                    if target.machine() == self.mpo.machine() {
                        self.route_down(target, request);
                    } else {
                        let _ = self.root.send(RootRequest::MpoUp { target, request }).await;
                    }
                }
                DaemonRequest::MpoDown { target, request } => self.route_down(target, request),
                DaemonRequest::MpRoot { request } => {
                    let _ = self.root.send(request).await;
                }
                DaemonRequest::MpoDestroyed { mpo } => {
                    for leaf in self.leaves.values() {
                        let leaf = leaf.clone();
                        tokio::spawn(async move {
                            let _ = leaf.send(LeafRequest::MpoDestroyed { mpo }).await;
                        });
                    }
                }
                DaemonRequest::Shutdown => {
                    for leaf in self.leaves.values() {
                        let leaf = leaf.clone();
                        tokio::spawn(async move {
                            let _ = leaf.send(LeafRequest::Shutdown).await;
                        });
                    }
                    break;
                }
            }
        }
        debug!(daemon = %self.mpo, "daemon stopped");
    }

    fn route_down(&self, target: Mpo, request: SimRequest) {
        match self.leaves.get(&target.mp()) {
            Some(leaf) => {
                let leaf = leaf.clone();
                tokio::spawn(async move {
                    let _ = leaf.send(LeafRequest::MpoDown { target, request }).await;
                });
            }
            None => request.reject(RuntimeError::NoLeaf(target.mp())),
        }
    }
}

/// Per-process hosting task.
struct LeafTask {
    mpo: Mpo,
    daemon: DaemonHandle,
    /// Self handle, given to every hosted simulation for routing.
    handle: LeafHandle,
    memory: LeafMemoryHandle,
    behaviors: BehaviorFactory,
    config: NetworkConfig,
    sims: HashMap<Mpo, SimHandle>,
    rx: mpsc::Receiver<LeafRequest>,
}

impl LeafTask {
    async fn spawn(
        daemon: DaemonHandle,
        registry: SegmentRegistry,
        provider: Arc<dyn CodeProvider>,
        behaviors: BehaviorFactory,
        config: NetworkConfig,
    ) -> Result<(Mpo, LeafHandle)> {
        let (tx, rx) = mpsc::channel(config.channel_depth);
        let handle = LeafHandle::new(tx);
        let (reply, reply_rx) = oneshot::channel();
        daemon
            .send(DaemonRequest::EnroleLeaf {
                leaf: handle.clone(),
                reply,
            })
            .await?;
        let mpo = await_reply(reply_rx).await?;

        let memory = LeafMemory::new(
            mpo.process(),
            registry,
            Arc::new(LocalSegmentNames),
            provider,
        )
        .into_handle();
        let task = Self {
            mpo,
            daemon,
            handle: handle.clone(),
            memory,
            behaviors,
            config,
            sims: HashMap::new(),
            rx,
        };
        tokio::spawn(task.run());
        Ok((mpo, handle))
    }

    async fn run(mut self) {
        info!(leaf = %self.mpo.mp(), "leaf running");
        while let Some(request) = self.rx.recv().await {
            match request {
                LeafRequest::RunSimulation {
                    mpo,
                    conversation,
                    root_address,
                    reply,
                } => {
                    let behavior = (self.behaviors)(mpo);
                    let result = SimulationHost::spawn(
                        mpo,
                        conversation,
                        root_address,
                        self.handle.clone(),
                        self.memory.clone(),
                        behavior,
                        self.config.sim,
                        self.config.channel_depth,
                    );
                    match result {
                        Ok(sim) => {
                            self.sims.insert(mpo, sim);
                            let _ = reply.send(Ok(()));
                        }
                        Err(err) => {
                            let _ = reply.send(Err(err));
                        }
                    }
                }
                LeafRequest::MpoUp { target, request } => {
                    if let Some(sim) = self.sims.get(&target) {
                        let _ = sim.send(request).await;
                    } else {
                        let _ = self.daemon.send(DaemonRequest::MpoUp { target, request }).await;
                    }
                }
                LeafRequest::MpoDown { target, request } => match self.sims.get(&target) {
                    Some(sim) => {
                        let _ = sim.send(request).await;
                    }
                    None => request.reject(RuntimeError::UnknownSimulation(target)),
                },
                LeafRequest::MpRoot { request } => {
                    let _ = self.daemon.send(DaemonRequest::MpRoot { request }).await;
                }
                LeafRequest::SimulationTerminating { mpo } => {
                    debug!(%mpo, "simulation draining");
                }
                LeafRequest::SimulationStopped { mpo } => {
                    self.sims.remove(&mpo);
                    let _ = self
                        .daemon
                        .send(DaemonRequest::MpRoot {
                            request: RootRequest::SimStopped { mpo },
                        })
                        .await;
                }
                LeafRequest::MpoDestroyed { mpo } => match lock_memory(&self.memory) {
                    Ok(mut memory) => {
                        if let Err(err) = memory.release_remote(mpo) {
                            warn!(%mpo, %err, "failed to release a destroyed simulation");
                        }
                    }
                    Err(err) => warn!(%mpo, %err, "memory unavailable for release"),
                },
                LeafRequest::Shutdown => {
                    for sim in self.sims.values() {
                        let sim = sim.clone();
                        tokio::spawn(async move {
                            let _ = sim
                                .send(SimRequest::Lock {
                                    msg: destroy_msg(),
                                    transaction: None,
                                    reply: None,
                                })
                                .await;
                        });
                    }
                    break;
                }
            }
        }
        debug!(leaf = %self.mpo.mp(), "leaf stopped");
    }
}

/// An enrolled machine.
#[derive(Debug)]
pub struct Daemon {
    mpo: Mpo,
    handle: DaemonHandle,
}

impl Daemon {
    /// The machine's identity in the mesh.
    pub fn mpo(&self) -> Mpo {
        self.mpo
    }
}

/// An enrolled worker process.
#[derive(Debug)]
pub struct Leaf {
    mpo: Mpo,
    handle: LeafHandle,
}

impl Leaf {
    /// The process's identity in the mesh.
    pub fn mpo(&self) -> Mpo {
        self.mpo
    }

    /// Routing handle into the process, for externally driven requests.
    pub fn handle(&self) -> &LeafHandle {
        &self.handle
    }
}

/// A running mesh: the root task plus the pieces every enrolled process
/// shares.
pub struct Network {
    config: NetworkConfig,
    root: RootHandle,
    registry: SegmentRegistry,
    provider: Arc<dyn CodeProvider>,
}

impl Network {
    /// Start a mesh with an in-memory stash. Must be called from within
    /// a tokio runtime.
    pub fn new(config: NetworkConfig, provider: Arc<dyn CodeProvider>) -> Self {
        Self::with_stash(config, provider, Box::new(MemoryStash::new()))
    }

    /// Start a mesh with the given stash backend.
    pub fn with_stash(
        config: NetworkConfig,
        provider: Arc<dyn CodeProvider>,
        stash: Box<dyn Stash>,
    ) -> Self {
        let root = RootTask::spawn(config.clone(), stash);
        Self {
            config,
            root,
            registry: SegmentRegistry::new(),
            provider,
        }
    }

    /// Enrole a machine.
    pub async fn enrole_daemon(&self) -> Result<Daemon> {
        let (mpo, handle) = DaemonTask::spawn(self.root.clone(), self.config.channel_depth).await?;
        Ok(Daemon { mpo, handle })
    }

    /// Enrole a worker process under `daemon`. Simulations created on it
    /// get their behavior from `behaviors`.
    pub async fn enrole_leaf(&self, daemon: &Daemon, behaviors: BehaviorFactory) -> Result<Leaf> {
        let (mpo, handle) = LeafTask::spawn(
            daemon.handle.clone(),
            self.registry.clone(),
            self.provider.clone(),
            behaviors,
            self.config.clone(),
        )
        .await?;
        Ok(Leaf { mpo, handle })
    }

    /// Create and run a simulation on `leaf`, returning its identity
    /// once it is live.
    pub async fn create_simulation(&self, leaf: &Leaf) -> Result<Mpo> {
        self.root
            .request(RootRequest::sim_create(leaf.mpo.mp()))
            .await
    }

    /// Ask a simulation to terminate; resolves once its machine
    /// acknowledges the destroy.
    pub async fn destroy_simulation(&self, mpo: Mpo) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.root
            .send(RootRequest::MpoUp {
                target: mpo,
                request: SimRequest::Lock {
                    msg: destroy_msg(),
                    transaction: None,
                    reply: Some(reply),
                },
            })
            .await?;
        await_reply(rx).await?;
        Ok(())
    }

    /// Enrolled machines, ascending.
    pub async fn machines(&self) -> Result<Vec<MachineId>> {
        self.root.request(RootRequest::machines()).await
    }

    /// Enrolled leaf processes under `machine`, ascending.
    pub async fn processes(&self, machine: MachineId) -> Result<Vec<Mp>> {
        self.root.request(RootRequest::processes(machine)).await
    }

    /// Live simulations under `mp`, ascending.
    pub async fn simulations(&self, mp: Mp) -> Result<Vec<Mpo>> {
        self.root.request(RootRequest::mpos(mp)).await
    }

    /// Shut a leaf down and release its slot and the simulations under
    /// it.
    pub async fn disconnect_leaf(&self, daemon: &Daemon, leaf: Leaf) -> Result<()> {
        leaf.handle.send(LeafRequest::Shutdown).await?;
        let (reply, rx) = oneshot::channel();
        daemon
            .handle
            .send(DaemonRequest::LeafDisconnect {
                leaf: leaf.mpo,
                reply,
            })
            .await?;
        await_reply(rx).await
    }

    /// Shut a daemon down and release its machine slot and everything
    /// under it.
    pub async fn disconnect_daemon(&self, daemon: Daemon) -> Result<()> {
        daemon.handle.send(DaemonRequest::Shutdown).await?;
        self.root
            .request(RootRequest::daemon_disconnect(daemon.mpo))
            .await
    }

    /// Store a build artifact in the root stash.
    pub async fn stash(&self, key: &str, determinant: u64, data: Bytes) -> Result<()> {
        self.root
            .request(RootRequest::stash(key, determinant, data))
            .await
    }

    /// Fetch a build artifact if its determinant still matches.
    pub async fn restore(&self, key: &str, determinant: u64) -> Result<Option<Bytes>> {
        self.root
            .request(RootRequest::restore(key, determinant))
            .await
    }

    /// Drop every stashed artifact.
    pub async fn clear_stash(&self) -> Result<()> {
        self.root.request(RootRequest::stash_clear()).await
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("config", &self.config)
            .finish()
    }
}
