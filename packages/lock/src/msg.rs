//! Lock-protocol messages.

use simmesh_ident::{ConversationId, Mpo};

/// The five message kinds the state machine arbitrates.
///
/// Read, write and release carry the requesting MPO; destroy and clock are
/// addressed to the simulation as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Acquire a read lock for the requester.
    Read(Mpo),
    /// Acquire the write lock for the requester.
    Write(Mpo),
    /// Release the requester's held lock.
    Release(Mpo),
    /// Terminate the simulation.
    Destroy,
    /// Cycle clock tick.
    Clock,
}

/// One inbound lock-protocol message with its reply routing.
///
/// An acknowledgement is the originating message handed back to the host,
/// which replies to `sender` over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimMsg {
    /// What is being requested.
    pub kind: LockKind,
    /// The conversation to acknowledge.
    pub sender: ConversationId,
}

impl SimMsg {
    /// Build a message.
    pub fn new(kind: LockKind, sender: ConversationId) -> Self {
        Self { kind, sender }
    }
}
