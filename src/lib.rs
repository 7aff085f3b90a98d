//! # dmapool
//!
//! A multi-process, host-pinned DMA buffer pool over POSIX shared memory.
//!
//! The pool carves large fixed-size shared-memory segments into
//! power-of-two chunks with a buddy allocator kept inside the segments
//! themselves. Every cooperating process reserves one contiguous virtual
//! range at startup, so a chunk has a single stable pointer everywhere;
//! physical backing is committed only when a segment is actually used, and
//! a process that touches a segment it has not mapped yet attaches it
//! transparently from a SIGSEGV/SIGBUS handler.
//!
//! ## Features
//!
//! - **Cross-process pointers**: payload pointers allocated in one
//!   fork-descendant are dereferenceable in all of them
//! - **Lazy residency**: segments are backed, and optionally pinned for
//!   device DMA, only while they hold data
//! - **Buddy allocation**: constant-time split/merge over chunk classes
//!   from 256 bytes to 16 GiB, with in-band integrity magic
//! - **Owner tracking**: every chunk belongs to an owner whose drop frees
//!   whatever it still holds
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dmapool::{DmaBufferPool, PoolConfig};
//!
//! let pool = DmaBufferPool::new(PoolConfig::default())?;
//! let owner = pool.owner();
//!
//! let ptr = pool.alloc(&owner, 64 * 1024)?;
//! // ... hand ptr to a forked worker, DMA into it, ...
//! pool.free(ptr)?;
//! ```
//!
//! Linux-only: the design leans on anonymous file-backed shared memory
//! (`shm_open`), fixed-address `mmap`, and signal-driven attachment.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

mod attach;
mod buddy;
mod chunk;
pub mod config;
pub mod error;
mod fault;
mod owner;
pub mod pin;
mod pool;
mod segment;
mod shm;
mod sync;
mod table;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use owner::BufferOwner;
pub use pin::{DevicePinner, NoopPinner};
pub use pool::{ClassReport, DmaBufferPool, SegmentReport};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::error::{Error, Result};
    pub use crate::owner::BufferOwner;
    pub use crate::pin::DevicePinner;
    pub use crate::pool::DmaBufferPool;
}
