//! Object memory for simulation instances.
//!
//! Objects in the mesh have two halves with different visibility:
//!
//! - a **shared part**, living in the owning simulation's named segment,
//!   readable by every process on the machine that attaches it
//! - a **heap part**, a per-process working extension that never crosses
//!   the process boundary
//!
//! Layout and construction come from outside through a [`CodeProvider`]:
//! the managers allocate raw aligned buffers and run the provider's
//! constructor and destructor routines over them, nothing more. The
//! [`SharedMemoryManager`] and [`HeapMemoryManager`] keep the two halves,
//! [`LeafMemory`] gathers one process's managers behind a single handle,
//! and [`MpoLifetime`] scopes a live simulation's memory to its run.

pub mod buf;
pub mod error;
pub mod heap;
pub mod lifetime;
pub mod provider;
pub mod segment;
pub mod shared;

pub use buf::AlignedBuf;
pub use error::{MemoryError, Result};
pub use heap::HeapMemoryManager;
pub use lifetime::{lock_memory, LeafMemory, LeafMemoryHandle, MpoLifetime};
pub use provider::{
    CodeProvider, FixedProvider, FnCache, ObjectFn, ObjectFunctions, ProviderCounters,
    SizeAlignment,
};
pub use segment::{
    lock_segment, HeapKey, LocalSegmentNames, Segment, SegmentAccess, SegmentHandle,
    SegmentRegistry, SharedHeader,
};
pub use shared::SharedMemoryManager;
