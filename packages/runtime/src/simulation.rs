//! Simulation hosting.
//!
//! One host task runs per simulation. It owns the lock state machine,
//! the [`MpoLifetime`] scope guard, the behavior, and its context, and
//! drives them from a single loop:
//!
//! - acks surfaced by the state machine are dispatched first; a write
//!   release's transaction applies before its ack goes out
//! - when the machine is in SIM the behavior runs one cycle; inbound
//!   requests keep being served while the cycle is suspended on a
//!   remote call, so two simulations locking each other in the same
//!   cycle both make progress
//! - clock ticks are parked while a cycle runs; the boundary only
//!   advances between cycles, once every grant is released
//!
//! The host exits when the machine reports terminated, drops the
//! lifetime (tearing down the simulation's memory), and reports the
//! stop to its leaf.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use simmesh_address::AddressError;
use simmesh_ident::{
    ConversationId, Mpo, NetworkAddress, Reference, TimeStamp, TypeId, TypeInstance,
};
use simmesh_lock::{LockKind, SimMsg, State, StateMachine};
use simmesh_memory::{lock_memory, LeafMemoryHandle, MpoLifetime};

use crate::config::SimConfig;
use crate::context::MpoContext;
use crate::envelope::{
    LeafHandle, LeafRequest, LockAck, ObjectSnapshot, RootRequest, SimHandle, SimRequest,
};
use crate::error::{Result, RuntimeError};
use crate::log::{SchedulingRecord, Transaction};

/// One simulation's application logic, invoked once per clock cycle.
#[async_trait]
pub trait Behavior: Send {
    async fn cycle(&mut self, ctx: &mut MpoContext) -> Result<()>;
}

/// Builds the behavior for each simulation created on a leaf.
pub type BehaviorFactory = Arc<dyn Fn(Mpo) -> Box<dyn Behavior> + Send + Sync>;

/// Behavior that does nothing each cycle.
#[derive(Debug, Default)]
pub struct Idle;

#[async_trait]
impl Behavior for Idle {
    async fn cycle(&mut self, _ctx: &mut MpoContext) -> Result<()> {
        Ok(())
    }
}

/// A requester waiting on an ack, with the transaction its release
/// carried.
struct PendingAck {
    reply: Option<oneshot::Sender<Result<LockAck>>>,
    transaction: Option<Transaction>,
}

/// The message-side half of a host: everything the request arms touch
/// while the cycle future owns the context and behavior.
struct Engine {
    mpo: Mpo,
    conversation: ConversationId,
    machine: StateMachine,
    timestamp: TimeStamp,
    config: SimConfig,
    tx: mpsc::Sender<SimRequest>,
    leaf: LeafHandle,
    memory: LeafMemoryHandle,
    pending: HashMap<ConversationId, PendingAck>,
    /// Clock ticks received while a cycle was running.
    parked: Vec<SimMsg>,
    /// Scheduling records delivered by release transactions, handed to
    /// the context before the next cycle.
    inbox: Vec<SchedulingRecord>,
}

impl Engine {
    /// Dispatch and clear every ack the machine has produced.
    fn flush_acks(&mut self) {
        let acks: Vec<SimMsg> = self.machine.acks().to_vec();
        self.machine.reset_acks();
        for ack in acks {
            self.dispatch_ack(ack);
        }
    }

    /// Answer one surfaced ack. A release's transaction applies before
    /// the ack is sent.
    fn dispatch_ack(&mut self, ack: SimMsg) {
        let granted = !self.machine.is_terminating();
        let Some(pending) = self.pending.remove(&ack.sender) else {
            // self-addressed messages carry no reply path
            return;
        };
        if matches!(ack.kind, LockKind::Release(_)) {
            if let Some(transaction) = pending.transaction {
                if let Err(err) = self.apply_transaction(transaction) {
                    warn!(mpo = %self.mpo, %err, "release transaction failed to apply");
                }
            }
        }
        if let Some(reply) = pending.reply {
            let _ = reply.send(Ok(LockAck {
                granted,
                timestamp: self.timestamp,
            }));
        }
    }

    /// Apply a writer's outbound effects to this simulation's state.
    fn apply_transaction(&mut self, transaction: Transaction) -> Result<()> {
        if !transaction.memory.is_empty() {
            let mut memory = lock_memory(&self.memory)?;
            for record in &transaction.memory {
                memory.write_object(&record.reference, &record.image, self.timestamp)?;
            }
            debug!(
                mpo = %self.mpo,
                writes = transaction.memory.len(),
                "release transaction applied"
            );
        }
        self.inbox.extend(transaction.scheduling);
        Ok(())
    }

    /// Serve one request arriving while a cycle is suspended. Lock
    /// messages feed the machine immediately so peers locking us make
    /// progress; clock ticks park until the cycle boundary.
    fn serve_mid_cycle(&mut self, request: SimRequest) {
        match request {
            SimRequest::Lock {
                msg,
                transaction,
                reply,
            } => {
                if matches!(msg.kind, LockKind::Clock) {
                    self.parked.push(msg);
                    return;
                }
                if reply.is_some() || transaction.is_some() {
                    self.pending
                        .insert(msg.sender, PendingAck { reply, transaction });
                }
                match self.machine.on_msg(vec![msg]) {
                    Ok(_) => self.flush_acks(),
                    Err(err) => {
                        error!(mpo = %self.mpo, %err, "lock protocol violation, terminating");
                        self.begin_destroy();
                    }
                }
            }
            SimRequest::Snapshot { address, reply } => {
                let _ = reply.send(self.serve_snapshot(address));
            }
            SimRequest::Allocate { type_id, reply } => self.serve_allocate(type_id, reply),
        }
    }

    /// Sort a pumped request into the machine batch or serve it inline.
    fn classify(&mut self, request: SimRequest, batch: &mut Vec<SimMsg>) {
        match request {
            SimRequest::Lock {
                msg,
                transaction,
                reply,
            } => {
                if reply.is_some() || transaction.is_some() {
                    self.pending
                        .insert(msg.sender, PendingAck { reply, transaction });
                }
                batch.push(msg);
            }
            SimRequest::Snapshot { address, reply } => {
                let _ = reply.send(self.serve_snapshot(address));
            }
            SimRequest::Allocate { type_id, reply } => self.serve_allocate(type_id, reply),
        }
    }

    /// Feed one batch through the machine. A consumed clock tick
    /// advances the cycle count, schedules the next tick, and makes
    /// the next cycle due.
    fn pump(&mut self, batch: Vec<SimMsg>) -> bool {
        match self.machine.on_msg(batch) {
            Ok(ticked) => {
                if ticked {
                    self.timestamp = self.timestamp.next();
                    if !self.machine.is_terminating() {
                        self.issue_clock();
                    }
                }
                ticked
            }
            Err(err) => {
                error!(mpo = %self.mpo, %err, "lock protocol violation, terminating");
                self.begin_destroy();
                false
            }
        }
    }

    /// The current image of an object this process knows at `address`.
    fn serve_snapshot(&mut self, address: NetworkAddress) -> Result<ObjectSnapshot> {
        let mut memory = lock_memory(&self.memory)?;
        let stored = memory
            .lookup(address)
            .ok_or(RuntimeError::Address(AddressError::UnknownAddress(address)))?;
        let reference = Reference::Heap(stored);
        let (image, timestamp) = memory.read_object(&reference)?;
        Ok(ObjectSnapshot {
            reference,
            image,
            timestamp,
        })
    }

    /// Allocate and construct an object owned by this simulation,
    /// answered in network form. The root round trip runs on a helper
    /// task; the host must keep draining its channel while it waits.
    fn serve_allocate(&self, type_id: TypeId, reply: oneshot::Sender<Result<Reference>>) {
        let leaf = self.leaf.clone();
        let memory = self.memory.clone();
        let mpo = self.mpo;
        tokio::spawn(async move {
            let result: Result<Reference> = async {
                let address = leaf
                    .root_request(RootRequest::allocate_address(mpo, type_id))
                    .await?;
                lock_memory(&memory)?.construct_object(
                    mpo,
                    TypeInstance::object(type_id),
                    address,
                )?;
                Ok(Reference::network(TypeInstance::object(type_id), address))
            }
            .await;
            let _ = reply.send(result);
        });
    }

    /// Feed a self-addressed destroy through the request channel so it
    /// takes the normal path at the next pump.
    fn begin_destroy(&mut self) {
        let msg = SimMsg::new(LockKind::Destroy, self.conversation);
        let request = SimRequest::Lock {
            msg,
            transaction: None,
            reply: None,
        };
        if self.tx.try_send(request).is_err() {
            // channel full; feed the machine directly
            if let Err(err) = self.machine.on_msg(vec![msg]) {
                error!(mpo = %self.mpo, %err, "destroy rejected by the state machine");
            }
            self.flush_acks();
        }
    }

    /// Self-send a clock tick after the configured period.
    fn issue_clock(&self) {
        let tx = self.tx.clone();
        let conversation = self.conversation;
        let period = self.config.clock_period;
        tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let _ = tx
                .send(SimRequest::Lock {
                    msg: SimMsg::new(LockKind::Clock, conversation),
                    transaction: None,
                    reply: None,
                })
                .await;
        });
    }
}

/// Host task for one simulation.
pub(crate) struct SimulationHost {
    engine: Engine,
    rx: mpsc::Receiver<SimRequest>,
    context: MpoContext,
    behavior: Box<dyn Behavior>,
    lifetime: MpoLifetime,
    terminating_notified: bool,
}

impl SimulationHost {
    /// Register the simulation's memory, spawn its host task, and hand
    /// back the handle requests are routed through. Fails without side
    /// effects when the lifetime cannot be established.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        mpo: Mpo,
        conversation: ConversationId,
        root_address: NetworkAddress,
        leaf: LeafHandle,
        memory: LeafMemoryHandle,
        behavior: Box<dyn Behavior>,
        config: SimConfig,
        channel_depth: usize,
    ) -> Result<SimHandle> {
        let lifetime = MpoLifetime::new(memory.clone(), mpo, conversation, root_address)?;
        let context =
            MpoContext::new(mpo, conversation, lifetime.root(), leaf.clone(), memory.clone());
        let (tx, rx) = mpsc::channel(channel_depth);
        let host = Self {
            engine: Engine {
                mpo,
                conversation,
                machine: StateMachine::new(),
                timestamp: TimeStamp::FIRST,
                config,
                tx: tx.clone(),
                leaf,
                memory,
                pending: HashMap::new(),
                parked: Vec::new(),
                inbox: Vec::new(),
            },
            rx,
            context,
            behavior,
            lifetime,
            terminating_notified: false,
        };
        tokio::spawn(host.run());
        Ok(SimHandle::new(mpo, tx))
    }

    async fn run(mut self) {
        info!(mpo = %self.engine.mpo, "simulation running");
        self.engine.issue_clock();

        // the first cycle runs immediately; later cycles wait for the
        // clock tick that closes the previous boundary
        let mut cycle_due = true;

        loop {
            self.engine.flush_acks();

            if self.engine.machine.is_terminating() && !self.terminating_notified {
                self.terminating_notified = true;
                let leaf = self.engine.leaf.clone();
                let mpo = self.engine.mpo;
                tokio::spawn(async move {
                    let _ = leaf.send(LeafRequest::SimulationTerminating { mpo }).await;
                });
            }
            if self.engine.machine.is_terminated() {
                break;
            }

            if cycle_due && self.engine.machine.state() == State::Sim {
                self.run_cycle().await;
                cycle_due = false;
                continue;
            }

            // ticks parked during the cycle pump before blocking for
            // new requests
            if !self.engine.parked.is_empty() {
                let parked = std::mem::take(&mut self.engine.parked);
                cycle_due |= self.engine.pump(parked);
                continue;
            }

            // pump: block for one request, drain whatever else is
            // ready, then feed the machine one batch
            let Some(first) = self.rx.recv().await else {
                break;
            };
            let mut batch = vec![first];
            while let Ok(more) = self.rx.try_recv() {
                batch.push(more);
            }
            let mut lock_batch: Vec<SimMsg> = Vec::with_capacity(batch.len());
            for request in batch {
                self.engine.classify(request, &mut lock_batch);
            }
            cycle_due |= self.engine.pump(lock_batch);
        }

        debug!(
            mpo = %self.engine.mpo,
            cycles = self.engine.timestamp.value(),
            "simulation stopped"
        );
        // memory goes down before anyone learns the slot is free, and
        // the channel closes first so a routing hop blocked on it fails
        // instead of waiting on a host that no longer drains
        drop(self.rx);
        drop(self.lifetime);
        let _ = self
            .engine
            .leaf
            .send(LeafRequest::SimulationStopped {
                mpo: self.engine.mpo,
            })
            .await;
    }

    /// Run one behavior cycle, serving inbound requests whenever the
    /// cycle suspends on a remote call.
    async fn run_cycle(&mut self) {
        self.context.set_now(self.engine.timestamp);
        self.context
            .deliver_scheduling(std::mem::take(&mut self.engine.inbox));

        let (outcome, completion) = {
            let engine = &mut self.engine;
            let rx = &mut self.rx;
            let behavior = &mut self.behavior;
            let context = &mut self.context;

            let cycle = async {
                let outcome = behavior.cycle(context).await;
                // held grants release even when the cycle failed
                let completion = context.cycle_complete().await;
                (outcome, completion)
            };
            tokio::pin!(cycle);

            loop {
                tokio::select! {
                    result = &mut cycle => break result,
                    request = rx.recv() => {
                        if let Some(request) = request {
                            engine.serve_mid_cycle(request);
                        }
                    }
                }
            }
        };

        if let Err(err) = outcome {
            error!(mpo = %self.engine.mpo, %err, "cycle failed, terminating");
            self.engine.begin_destroy();
        }
        if let Err(err) = completion {
            error!(mpo = %self.engine.mpo, %err, "cycle completion failed, terminating");
            self.engine.begin_destroy();
        }
        if self.context.take_finished() {
            self.engine.begin_destroy();
        }
    }
}
