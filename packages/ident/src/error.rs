//! Error types for identity allocation.

use thiserror::Error;

/// Errors that can occur while minting identities.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IdentError {
    /// Every slot of a fixed-capacity allocator is held.
    #[error("allocator at capacity ({0} slots)")]
    Capacity(u16),
}

/// Result type alias for identity operations.
pub type Result<T> = std::result::Result<T, IdentError>;
