//! The per-simulation lock state machine.
//!
//! One instance lives inside each simulation's host task and is fed whole
//! message batches, one batch per invocation. It never blocks and never
//! sees wall-clock time; clock ticks are just another message. Every
//! acknowledgement is the originating message, produced in encounter
//! order, for the host to answer over the transport.

use std::collections::BTreeSet;

use tracing::{debug, error};

use simmesh_ident::Mpo;

use crate::error::{LockError, Result};
use crate::msg::{LockKind, SimMsg};

/// Lock phase of one simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Running a cycle.
    Sim,
    /// Idle between cycles, no lock held.
    Wait,
    /// One or more active readers.
    Read,
    /// One active writer.
    Write,
    /// Terminating; every request drains with an ack.
    Term,
}

/// Serializes concurrent lock traffic into safe phases.
#[derive(Debug)]
pub struct StateMachine {
    acks: Vec<SimMsg>,
    state: State,
    queue: Vec<SimMsg>,
    active_reads: BTreeSet<Mpo>,
    active_write: Option<Mpo>,
}

impl StateMachine {
    /// A fresh machine, ready to run its first cycle.
    pub fn new() -> Self {
        Self {
            acks: Vec::new(),
            state: State::Sim,
            queue: Vec::new(),
            active_reads: BTreeSet::new(),
            active_write: None,
        }
    }

    /// Current lock phase.
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether a destroy has been observed.
    pub fn is_terminating(&self) -> bool {
        self.state == State::Term
    }

    /// Whether termination has fully drained: no active locks and every
    /// produced ack consumed by the host.
    pub fn is_terminated(&self) -> bool {
        self.state == State::Term
            && self.active_reads.is_empty()
            && self.active_write.is_none()
            && self.acks.is_empty()
    }

    /// Acknowledgements produced by the last [`on_msg`](Self::on_msg), in
    /// encounter order.
    pub fn acks(&self) -> &[SimMsg] {
        &self.acks
    }

    /// Clear the ack buffer once the host has dispatched the replies.
    pub fn reset_acks(&mut self) {
        self.acks.clear();
    }

    /// Process one inbound batch. Returns true when a clock tick was
    /// consumed, meaning the cycle boundary passed and the host should
    /// advance its timestamp and schedule the next tick.
    pub fn on_msg(&mut self, batch: Vec<SimMsg>) -> Result<bool> {
        if batch
            .iter()
            .any(|msg| matches!(msg.kind, LockKind::Destroy))
        {
            debug!(from = ?self.state, "destroy observed, terminating");
            self.state = State::Term;
        }

        self.reset_acks();
        self.queue.extend(batch);

        match self.state {
            State::Sim | State::Wait => self.on_wait(),
            State::Read => self.on_read(),
            State::Write => self.on_write(),
            State::Term => self.on_term(),
        }
    }

    /// No lock held. Pending reads win as a group; otherwise a single
    /// write may be taken, and a clock tick ends the wait.
    fn on_wait(&mut self) -> Result<bool> {
        let mut clock_ticked = false;
        self.state = State::Wait;

        let (reads, other): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|msg| matches!(msg.kind, LockKind::Read(_)));

        if !reads.is_empty() {
            for msg in reads {
                if let LockKind::Read(id) = msg.kind {
                    self.active_reads.insert(id);
                }
                self.acks.push(msg);
            }
            self.queue = other;
            self.state = State::Read;
        } else if !other.is_empty() {
            for msg in other {
                match msg.kind {
                    LockKind::Write(id) => {
                        if self.state == State::Wait {
                            self.acks.push(msg);
                            self.active_write = Some(id);
                            self.state = State::Write;
                        } else {
                            self.queue.push(msg);
                        }
                    }
                    LockKind::Release(id) => {
                        error!(requester = %id, "release with no lock outstanding");
                        return Err(LockError::ReleaseWithoutLock { requester: id });
                    }
                    LockKind::Clock => {
                        if self.state == State::Wait {
                            self.state = State::Sim;
                            clock_ticked = true;
                        } else if self.state != State::Sim {
                            self.queue.push(msg);
                        }
                        // a second tick on the same boundary is dropped
                    }
                    LockKind::Read(_) | LockKind::Destroy => {
                        unreachable!("partitioned out or handled before dispatch")
                    }
                }
            }
        } else {
            self.state = State::Wait;
        }
        Ok(clock_ticked)
    }

    /// Readers active. New reads join, releases shrink the set, a sole
    /// remaining reader may promote to the write lock, and the clock only
    /// passes once the set is empty.
    fn on_read(&mut self) -> Result<bool> {
        let mut clock_ticked = false;

        // releases and joining reads first
        let mut other = Vec::new();
        for msg in std::mem::take(&mut self.queue) {
            match msg.kind {
                LockKind::Read(id) => {
                    self.active_reads.insert(id);
                    self.acks.push(msg);
                }
                LockKind::Release(id) => {
                    if self.active_reads.remove(&id) {
                        self.acks.push(msg);
                    } else {
                        error!(requester = %id, "release from non-reader");
                        return Err(LockError::ReleaseWithoutLock { requester: id });
                    }
                }
                _ => other.push(msg),
            }
        }

        // a single remaining reader may promote its read to a write
        if self.active_reads.len() == 1 {
            let mut kept = Vec::new();
            for msg in other {
                match msg.kind {
                    LockKind::Write(id)
                        if self.state == State::Read
                            && self.active_reads.first() == Some(&id) =>
                    {
                        self.state = State::Write;
                        self.active_reads.clear();
                        self.active_write = Some(id);
                        self.acks.push(msg);
                    }
                    _ => kept.push(msg),
                }
            }
            other = kept;
        }

        for msg in other {
            match msg.kind {
                LockKind::Write(_) => self.queue.push(msg),
                LockKind::Clock => {
                    if self.active_reads.is_empty() && self.state == State::Read {
                        self.state = State::Sim;
                        clock_ticked = true;
                    } else {
                        self.queue.push(msg);
                    }
                }
                LockKind::Read(_) | LockKind::Release(_) | LockKind::Destroy => {
                    unreachable!("consumed above or handled before dispatch")
                }
            }
        }
        Ok(clock_ticked)
    }

    /// One writer active. Duplicate writes and reentrant reads by the
    /// writer ack immediately; on release a queued writer takes over;
    /// everyone else waits for the cycle boundary.
    fn on_write(&mut self) -> Result<bool> {
        let mut clock_ticked = false;

        // duplicate writes by the current writer ack immediately
        let mut other = Vec::new();
        for msg in std::mem::take(&mut self.queue) {
            match msg.kind {
                LockKind::Write(id) if self.active_write == Some(id) => self.acks.push(msg),
                _ => other.push(msg),
            }
        }

        // apply releases before granting anything further
        let mut kept = Vec::new();
        for msg in other {
            match msg.kind {
                LockKind::Release(id) => {
                    if self.active_write == Some(id) {
                        self.active_write = None;
                        self.acks.push(msg);
                    } else {
                        error!(requester = %id, "release from non-writer");
                        return Err(LockError::ReleaseWithoutLock { requester: id });
                    }
                }
                _ => kept.push(msg),
            }
        }

        // stay in WRITE until a clock tick lands with no writer
        for msg in kept {
            match msg.kind {
                LockKind::Read(id) => {
                    if self.active_write == Some(id) {
                        // reentrant read by the writer
                        self.acks.push(msg);
                    } else {
                        self.queue.push(msg);
                    }
                }
                LockKind::Write(id) => {
                    if self.state == State::Write && self.active_write.is_none() {
                        self.acks.push(msg);
                        self.active_write = Some(id);
                    } else {
                        self.queue.push(msg);
                    }
                }
                LockKind::Clock => {
                    if self.active_write.is_none() {
                        self.state = State::Sim;
                        clock_ticked = true;
                    } else {
                        self.queue.push(msg);
                    }
                }
                LockKind::Release(_) | LockKind::Destroy => {
                    unreachable!("consumed above or handled before dispatch")
                }
            }
        }
        Ok(clock_ticked)
    }

    /// Terminating: every request drains with an ack, releases still
    /// retire active locks, clocks are swallowed.
    fn on_term(&mut self) -> Result<bool> {
        let mut clock_ticked = false;
        for msg in std::mem::take(&mut self.queue) {
            match msg.kind {
                LockKind::Read(_) | LockKind::Write(_) | LockKind::Destroy => {
                    self.acks.push(msg);
                }
                LockKind::Release(id) => {
                    if self.active_reads.remove(&id) {
                        self.acks.push(msg);
                    } else if self.active_write == Some(id) {
                        self.active_write = None;
                        self.acks.push(msg);
                    } else {
                        error!(requester = %id, "release while terminating with no lock");
                        return Err(LockError::ReleaseWithoutLock { requester: id });
                    }
                }
                LockKind::Clock => clock_ticked = true,
            }
        }
        Ok(clock_ticked)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
