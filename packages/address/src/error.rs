//! Error types for the addressing layer.

use thiserror::Error;

use simmesh_ident::{ConversationId, IdentError, MachineId, Mp, Mpo, NetworkAddress};

/// Errors that can occur in the address space and MPO manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The network address is not currently owned.
    #[error("network address {0} has no owner")]
    UnknownAddress(NetworkAddress),

    /// A deallocation named an MPO that does not own the address.
    #[error("network address {address} is owned by {owner}, not {caller}")]
    NotOwner {
        /// The address being deallocated.
        address: NetworkAddress,
        /// Its actual owner.
        owner: Mpo,
        /// The MPO that attempted the deallocation.
        caller: Mpo,
    },

    /// The machine was never enrolled or has disconnected.
    #[error("machine {0} is not enrolled")]
    UnknownMachine(MachineId),

    /// The leaf process was never enrolled or has disconnected.
    #[error("process {0} is not enrolled")]
    UnknownProcess(Mp),

    /// No simulation is registered for the conversation.
    #[error("no simulation registered for conversation {0}")]
    UnknownConversation(ConversationId),

    /// No conversation is registered for the MPO.
    #[error("no conversation registered for simulation {0}")]
    UnknownMpo(Mpo),

    /// No root object has been recorded for the MPO.
    #[error("no root recorded for {0}")]
    UnknownRoot(Mpo),

    /// An identity allocator is exhausted.
    #[error(transparent)]
    Capacity(#[from] IdentError),
}

/// Result type alias for addressing operations.
pub type Result<T> = std::result::Result<T, AddressError>;
