//! Device pinning seam.
//!
//! The pool itself never talks to a device driver; it calls through this
//! trait when a segment becomes or ceases to be resident in the current
//! process. A CUDA binding would forward to `cuMemHostRegister` /
//! `cuMemHostUnregister`, a Vulkan one to external-host-memory import.

use crate::error::Result;

/// Registers mapped segments with a device driver for DMA.
///
/// `pin` is called right after a segment is mapped read-write in this
/// process, `unpin` right before it is unmapped. Both run under the pool's
/// exclusive table lock on the create/destroy paths.
///
/// # Signal safety
///
/// When the on-demand fault handler attaches a segment, it calls `pin` and
/// `unpin` from signal context. Implementations must therefore restrict
/// themselves to async-signal-safe operations: no allocation, no locks
/// shared with interrupted code, no logging frameworks.
pub trait DevicePinner: Send + Sync {
    /// Pin `len` bytes at `ptr` for device DMA.
    fn pin(&self, ptr: *mut u8, len: usize) -> Result<()>;

    /// Release a previously pinned region starting at `ptr`.
    fn unpin(&self, ptr: *mut u8, len: usize) -> Result<()>;
}

/// Pinner that does nothing; useful when no device is present.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPinner;

impl DevicePinner for NoopPinner {
    fn pin(&self, _ptr: *mut u8, _len: usize) -> Result<()> {
        Ok(())
    }

    fn unpin(&self, _ptr: *mut u8, _len: usize) -> Result<()> {
        Ok(())
    }
}
