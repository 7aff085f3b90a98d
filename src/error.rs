//! Error types for dmapool.

use thiserror::Error;

/// Result type alias using dmapool's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A pointer failed validation against the in-band chunk metadata.
    #[error("corrupted buffer pointer: {0}")]
    Corrupted(String),

    /// The normalized request does not fit a single segment.
    #[error("request of {required} bytes exceeds segment capacity ({max} bytes usable)")]
    TooLarge {
        /// Requested payload length in bytes.
        required: usize,
        /// Largest payload length one segment can hold.
        max: usize,
    },

    /// Every segment descriptor is already in use.
    #[error("out of buffer segments: all {0} descriptors active")]
    OutOfSegments(u32),

    /// Device pinning of a freshly mapped segment failed.
    #[error("device pinning failed: {0}")]
    PinFailed(String),

    /// The pool configuration is unusable.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Another pool in this process already owns the fault-handler slot.
    #[error("a pool is already registered for fault handling in this process")]
    HandlerInUse,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
