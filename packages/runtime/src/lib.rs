//! Simulation hosting for the simmesh runtime.
//!
//! This crate turns the identity, lock and memory layers into a running
//! mesh:
//!
//! - [`Network`] starts the root task and enrolls daemons (machines) and
//!   leaves (worker processes)
//! - each created simulation runs on its own host task, driving a
//!   [`Behavior`] once per clock cycle against an [`MpoContext`]
//! - lock messages, object snapshots and allocations travel the tree as
//!   request envelopes; replies return directly over oneshot channels
//! - writers accumulate memory and scheduling records into a release
//!   transaction, applied at the target before the release is
//!   acknowledged
//!
//! Simulations address each other only by MPO and network address, so
//! behavior code is oblivious to which process anything runs in.

pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod log;
pub mod simulation;
pub mod stash;
pub mod topology;

pub use config::{NetworkConfig, SimConfig};
pub use context::MpoContext;
pub use envelope::{LockAck, ObjectSnapshot};
pub use error::{Result, RuntimeError};
pub use log::{MemoryRecord, SchedulingAction, SchedulingRecord, Transaction};
pub use simulation::{Behavior, BehaviorFactory, Idle};
pub use stash::{FileStash, MemoryStash, Stash};
pub use topology::{Daemon, Leaf, Network};
