//! Error types for lock arbitration.

use thiserror::Error;

use simmesh_ident::Mpo;

/// Fatal lock-protocol violations.
///
/// These indicate a transport or caller bug upstream of the state machine;
/// the hosting simulation aborts its logical thread rather than recover.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// A release arrived from an MPO holding no matching lock.
    #[error("release from {requester} with no matching lock held")]
    ReleaseWithoutLock {
        /// The MPO that sent the release.
        requester: Mpo,
    },
}

/// Result type alias for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
