//! Lock arbitration for simulation instances.
//!
//! Every simulation owns one [`StateMachine`] that serializes the read,
//! write, release, destroy and clock messages arriving from other
//! simulations into safe phases: many concurrent readers or exactly one
//! writer, with clock ticks advancing the cycle only when no lock is
//! outstanding. The machine is a pure message-in/ack-out transformer; its
//! host task owns delivery and reply routing.
//!
//! The [`LockTracker`] is the requester-side record of grants held during
//! the current cycle, consumed by the cycle-complete release sweep.

pub mod error;
pub mod msg;
pub mod state_machine;
pub mod tracker;

pub use error::{LockError, Result};
pub use msg::{LockKind, SimMsg};
pub use state_machine::{State, StateMachine};
pub use tracker::LockTracker;
