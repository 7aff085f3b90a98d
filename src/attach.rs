//! Segment creation, destruction, and address-space plumbing.
//!
//! The pool owns one big `PROT_NONE` reservation covering every segment
//! slot. Creating a segment replaces its slot with a read-write `MAP_FIXED`
//! mapping of a fresh shared-memory object; destroying it flips the slot
//! back to `PROT_NONE`. Peer processes never hear about either directly:
//! they notice the revision change the next time they touch the slot and
//! the fault handler (see [`crate::fault`]) re-attaches them.

use crate::buddy;
use crate::error::{Error, Result};
use crate::pool::PoolShared;
use crate::segment::revision_exists;
use crate::shm::{self, ShmName};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::sync::atomic::Ordering;

/// RAII mapping of a virtual address range.
pub(crate) struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain memory; all concurrent access to its
// contents is mediated by the locks living inside it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Unmap the region; the fd (if any) was closed long ago.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// Reserve a contiguous `PROT_NONE` range for every segment slot. No
/// physical memory is committed; the range only pins addresses.
pub(crate) fn reserve_address_range(len: usize) -> Result<Mapping> {
    let ptr = unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            len,
            ProtFlags::empty(),
            MapFlags::PRIVATE,
        )?
    };
    Ok(Mapping {
        ptr: ptr.cast(),
        len,
    })
}

/// Map the control-region object shared and read-write.
pub(crate) fn map_control_region(fd: &OwnedFd, len: usize) -> Result<Mapping> {
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    Ok(Mapping {
        ptr: ptr.cast(),
        len,
    })
}

/// The address space is inconsistent and the process cannot continue.
fn fatal_os(context: &str, errno: rustix::io::Errno) -> ! {
    tracing::error!(context, %errno, "irrecoverable address-space failure");
    eprintln!("dmapool fatal: {context}: {errno}");
    std::process::abort();
}

impl PoolShared {
    /// Map a segment object over its slot, read-write and shared.
    fn map_segment_rw(&self, base: *mut u8, fd: &OwnedFd) -> Result<()> {
        let ptr = unsafe {
            rustix::mm::mmap(
                base.cast(),
                self.cfg.segment_size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED | MapFlags::FIXED,
                fd,
                0,
            )?
        };
        debug_assert_eq!(ptr, base.cast());
        Ok(())
    }

    /// Drop a segment's file-backed mapping. Failure is fatal.
    fn unmap_or_abort(&self, base: *mut u8) {
        if let Err(e) = unsafe { rustix::mm::munmap(base.cast(), self.cfg.segment_size) } {
            fatal_os("munmap of segment slot", e);
        }
    }

    /// Reinstate the `PROT_NONE` placeholder over a slot. Failure is fatal.
    fn remap_none_or_abort(&self, base: *mut u8) {
        let r = unsafe {
            rustix::mm::mmap_anonymous(
                base.cast(),
                self.cfg.segment_size,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::FIXED,
            )
        };
        match r {
            Ok(ptr) => debug_assert_eq!(ptr, base.cast()),
            Err(e) => fatal_os("remap of segment slot to PROT_NONE", e),
        }
    }

    /// Unregister a pinned slot. The driver's bookkeeping is unknown after
    /// a failure, so it is fatal, like an unmap failure.
    fn unpin_or_abort(&self, base: *mut u8) {
        if let Some(pinner) = &self.pinner {
            if let Err(e) = pinner.unpin(base, self.cfg.segment_size) {
                tracing::error!(error = %e, "device unpin failed");
                eprintln!("dmapool fatal: device unpin failed: {e}");
                std::process::abort();
            }
        }
    }

    /// Create the backing object for an inactive segment, map it at the
    /// segment's slot, pin it if a device is bound, and format it.
    ///
    /// Caller holds the table lock exclusively; the segment's revision is
    /// even. On success the revision has flipped to odd and this process's
    /// local map records the attachment.
    pub(crate) fn create_segment(&self, idx: u32) -> Result<()> {
        let table = self.table();
        let seg = table.segment(idx);
        let revision = seg.revision.load(Ordering::Acquire);
        debug_assert!(!revision_exists(revision));

        let name = ShmName::segment(self.cfg.namespace, idx, revision);
        let base = self.seg_base(idx);
        let local = &self.local[idx as usize];

        // A ghost mapping: this process still maps a prior incarnation that
        // some other process destroyed while we never touched it. Clear it
        // before installing the new object.
        if local.attached.load(Ordering::Relaxed) {
            self.unpin_or_abort(base);
            self.unmap_or_abort(base);
            self.remap_none_or_abort(base);
            local.attached.store(false, Ordering::Relaxed);
        }

        let fd = shm::create_object(&name, self.cfg.segment_size)?;
        if let Err(e) = self.map_segment_rw(base, &fd) {
            let _ = rustix::shm::shm_unlink(name.as_cstr());
            return Err(e);
        }
        drop(fd);

        if let Some(pinner) = &self.pinner {
            if let Err(e) = pinner.pin(base, self.cfg.segment_size) {
                self.unmap_or_abort(base);
                self.remap_none_or_abort(base);
                let _ = rustix::shm::shm_unlink(name.as_cstr());
                return Err(Error::PinFailed(e.to_string()));
            }
        }

        let view = self.view_of(idx);
        // SAFETY: mapped read-write above; revision is still even, so no
        // other process can reach the segment yet.
        unsafe { buddy::format(&view) };

        local.attached.store(true, Ordering::Relaxed);
        // The add publishes the odd (present) state and stamps the local map.
        let new_revision = seg.revision.fetch_add(1, Ordering::AcqRel) + 1;
        local.revision.store(new_revision, Ordering::Relaxed);
        tracing::debug!(
            pid = std::process::id(),
            segment = idx,
            revision = new_revision,
            name = %name,
            "segment created"
        );
        Ok(())
    }

    /// Flip a drained segment to non-resident and drop its backing object.
    ///
    /// Caller holds the table lock exclusively and the segment spinlock.
    /// Peer processes that still map the old incarnation will take a fault
    /// on their next touch and re-resolve through the revision.
    pub(crate) fn destroy_segment(&self, idx: u32) {
        let table = self.table();
        let seg = table.segment(idx);
        let base = self.seg_base(idx);
        let local = &self.local[idx as usize];

        // Flip odd -> even before unlinking, so a racing reader that still
        // observes the object also still finds it named.
        let old_revision = seg.revision.fetch_add(1, Ordering::AcqRel);
        debug_assert!(revision_exists(old_revision));

        if local.attached.load(Ordering::Relaxed) {
            self.unpin_or_abort(base);
            self.unmap_or_abort(base);
            self.remap_none_or_abort(base);
            local.attached.store(false, Ordering::Relaxed);
        }

        // Truncating first makes every peer's ghost mapping fault on touch
        // even if the unlink itself fails.
        let name = ShmName::segment(self.cfg.namespace, idx, old_revision);
        if let Err(e) = shm::truncate_and_unlink(&name) {
            tracing::warn!(segment = idx, name = %name, error = %e, "failed to drop segment object");
        }
        tracing::debug!(
            pid = std::process::id(),
            segment = idx,
            revision = old_revision + 1,
            "segment destroyed"
        );
    }
}
