//! Error types for simulation hosting.

use thiserror::Error;

use simmesh_address::AddressError;
use simmesh_ident::{MachineId, Mp, Mpo};
use simmesh_lock::LockError;
use simmesh_memory::MemoryError;

/// Errors surfaced by the mesh topology and simulation hosts.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Addressing or identity management failed.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// The lock protocol was violated.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Object memory failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// A routed request named a simulation nobody hosts.
    #[error("unknown simulation {0}")]
    UnknownSimulation(Mpo),

    /// No daemon is enrolled for the target machine.
    #[error("no daemon enrolled for machine {0}")]
    NoDaemon(MachineId),

    /// No leaf is enrolled for the target process.
    #[error("no leaf enrolled for process {0}")]
    NoLeaf(Mp),

    /// The target simulation observed a destroy and is draining.
    #[error("simulation {0} is terminating")]
    Terminating(Mpo),

    /// The peer task went away before answering.
    #[error("channel closed")]
    ChannelClosed,

    /// The configured ceiling on owned network addresses was hit.
    #[error("address space exhausted at {0} owned addresses")]
    AddressSpaceExhausted(usize),

    /// Stash storage failed.
    #[error("stash i/o: {0}")]
    StashIo(#[from] std::io::Error),
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
