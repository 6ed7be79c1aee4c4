//! Error types for object memory.

use simmesh_ident::{Mpo, ProcessId, Reference, TypeId};
use thiserror::Error;

/// Errors arising from segment management and object construction.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// A size/alignment pair the allocator cannot express.
    #[error("invalid layout: size {size}, alignment {alignment}")]
    InvalidLayout { size: usize, alignment: usize },

    /// The global allocator refused the request.
    #[error("allocation failed: size {size}, alignment {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    /// The code provider has no functions for this object type.
    #[error("no object functions for type {0}")]
    UnknownType(TypeId),

    /// A named segment was opened without being created first.
    #[error("shared segment unavailable: {0}")]
    SegmentUnavailable(String),

    /// A segment lock was poisoned by a panicking holder.
    #[error("segment lock poisoned: {0}")]
    SegmentPoisoned(String),

    /// The reference does not name an object this manager tracks.
    #[error("unknown object {0}")]
    UnknownObject(Reference),

    /// The object has no heap extension for the calling process.
    #[error("object {0} has no heap extension for process {1}")]
    NoHeapExtension(Reference, ProcessId),

    /// An operation needed the other reference form.
    #[error("expected a {expected} reference, got {reference}")]
    WrongForm {
        expected: &'static str,
        reference: Reference,
    },

    /// No root object has been constructed for this simulation.
    #[error("no root object for {0}")]
    NoRoot(Mpo),

    /// The simulation is not registered with this process.
    #[error("simulation {0} is not live here")]
    NotLive(Mpo),

    /// A second registration for a simulation already live here.
    #[error("simulation {0} is already live here")]
    AlreadyLive(Mpo),

    /// The leaf memory lock was poisoned by a panicking holder.
    #[error("leaf memory lock poisoned")]
    LeafPoisoned,

    /// A snapshot image larger than the object it refreshes.
    #[error("snapshot image of {image} bytes exceeds object size {object}")]
    ImageSize { image: usize, object: usize },
}

pub type Result<T> = std::result::Result<T, MemoryError>;
