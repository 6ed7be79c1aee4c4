//! Identity primitives for the simmesh runtime.
//!
//! Everything in the mesh is addressed through the types in this crate:
//!
//! - [`Mpo`] - the Machine/Process/Owner triple naming one simulation instance
//! - [`ConversationId`] - the logical-thread identifier owning a live MPO
//! - [`NetworkAddress`] - the location-independent slot of one object
//! - [`Reference`] - a typed handle to one object, in network or heap form
//! - [`RingAllocator`] - the fixed-capacity slot allocator every identity
//!   level is minted from
//!
//! The crate has no async or I/O surface; it is the shared vocabulary of the
//! layers above it.

pub mod constants;
pub mod conversation;
pub mod error;
pub mod mpo;
pub mod reference;
pub mod ring;

pub use constants::{
    MAX_MACHINES, MAX_OWNER_PER_PROCESS, MAX_PROCESS_PER_MACHINE, ROOT_OBJECT_ID, ROOT_TYPE_ID,
};
pub use conversation::ConversationId;
pub use error::{IdentError, Result};
pub use mpo::{MachineId, Mp, Mpo, OwnerId, ProcessId};
pub use reference::{
    HeapRef, NetworkAddress, NetworkRef, ObjectId, Reference, TimeStamp, TypeId, TypeInstance,
};
pub use ring::RingAllocator;
