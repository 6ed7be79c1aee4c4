//! Logical addressing and execution-context management.
//!
//! Two root-owned tables live here:
//!
//! - [`AddressSpace`] - maps monotonically minted network addresses to their
//!   owning MPO, with free-list reuse, defragmentation, and the root address
//!   book used to find a simulation's root object.
//! - [`MpoManager`] - mints MPO identifiers from hierarchical ring
//!   allocators (machine then process then owner) and keeps the one-to-one
//!   mapping between live MPOs and the conversations driving them.
//!
//! Neither table is internally synchronized; each is owned by the root
//! task's single management loop.

pub mod error;
pub mod manager;
pub mod space;

pub use error::{AddressError, Result};
pub use manager::MpoManager;
pub use space::AddressSpace;
