//! Segment descriptors and per-class free lists.
//!
//! A [`SegmentShared`] is the descriptor of one segment, living in the
//! control region where every process sees it. The segment's chunk memory
//! itself lives at a fixed slot of the virtual reservation; a
//! [`SegmentView`] pairs a descriptor with this process's mapping of that
//! slot and provides the intrusive free-list operations over it.
//!
//! Free-list links are segment-relative encoded offsets (see
//! [`Link`](crate::chunk::Link)). The list heads are atomics only so the
//! descriptor stays `Sync`; every mutation happens under the segment
//! spinlock and uses relaxed ordering.

use crate::chunk::{ChunkHeader, Link, NUM_CLASSES};
use crate::sync::Spinlock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Index value meaning "no segment" in the table's chain links.
pub(crate) const NO_SEGMENT: u32 = u32::MAX;

/// True when a revision's parity says the backing object exists.
pub(crate) fn revision_exists(revision: u32) -> bool {
    revision & 1 == 1
}

#[repr(C)]
pub(crate) struct FreeList {
    first: AtomicU64,
    last: AtomicU64,
}

impl FreeList {
    fn new() -> Self {
        Self {
            first: AtomicU64::new(Link::NIL.raw()),
            last: AtomicU64::new(Link::NIL.raw()),
        }
    }
}

/// Shared descriptor of one segment slot.
#[repr(C)]
pub(crate) struct SegmentShared {
    /// Links of the active/inactive intrusive lists (segment indices).
    pub(crate) chain_prev: AtomicU32,
    pub(crate) chain_next: AtomicU32,
    /// Slot index; fixed at table initialization.
    pub(crate) segment_id: u32,
    /// Non-zero for segments that survive draining to zero chunks.
    persistent: u32,
    /// Odd while the backing object exists, even while it does not. Read
    /// by the fault handler without any lock.
    pub(crate) revision: AtomicU32,
    /// Guards `num_chunks`, the free lists, and all chunk headers inside
    /// the segment.
    pub(crate) lock: Spinlock,
    /// Number of active (allocated) chunks.
    pub(crate) num_chunks: AtomicU32,
    free: [FreeList; NUM_CLASSES],
}

impl SegmentShared {
    pub(crate) fn new(segment_id: u32, persistent: bool) -> Self {
        Self {
            chain_prev: AtomicU32::new(NO_SEGMENT),
            chain_next: AtomicU32::new(NO_SEGMENT),
            segment_id,
            persistent: persistent as u32,
            revision: AtomicU32::new(0),
            lock: Spinlock::new(),
            num_chunks: AtomicU32::new(0),
            free: std::array::from_fn(|_| FreeList::new()),
        }
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.persistent != 0
    }
}

/// A segment descriptor paired with this process's mapping of its slot.
#[derive(Clone, Copy)]
pub(crate) struct SegmentView<'a> {
    pub(crate) seg: &'a SegmentShared,
    pub(crate) base: *mut u8,
    pub(crate) size: usize,
}

impl SegmentView<'_> {
    pub(crate) fn chunk_at(&self, offset: usize) -> *mut ChunkHeader {
        debug_assert!(offset < self.size);
        unsafe { self.base.add(offset).cast() }
    }

    pub(crate) fn offset_of(&self, chunk: *mut ChunkHeader) -> usize {
        chunk as usize - self.base as usize
    }

    pub(crate) fn free_is_empty(&self, mclass: u32) -> bool {
        Link::from_raw(self.free_list(mclass).first.load(Ordering::Relaxed)).is_nil()
    }

    fn free_list(&self, mclass: u32) -> &FreeList {
        &self.seg.free[mclass as usize]
    }

    /// Clear every free list. Used when (re)formatting a segment.
    pub(crate) fn reset_free_lists(&self) {
        for list in &self.seg.free {
            list.first.store(Link::NIL.raw(), Ordering::Relaxed);
            list.last.store(Link::NIL.raw(), Ordering::Relaxed);
        }
    }

    /// Push a free chunk onto the front of its class list.
    ///
    /// # Safety
    ///
    /// Caller holds the segment spinlock; `chunk` is a valid header inside
    /// this segment with class `mclass` and nil free links.
    pub(crate) unsafe fn free_push_head(&self, mclass: u32, chunk: *mut ChunkHeader) {
        let list = self.free_list(mclass);
        let link = Link::from_offset(self.offset_of(chunk));
        let old_first = Link::from_raw(list.first.load(Ordering::Relaxed));
        unsafe {
            (*chunk).free_prev = Link::HEAD.raw();
            (*chunk).free_next = if old_first.is_nil() {
                Link::HEAD.raw()
            } else {
                old_first.raw()
            };
            if old_first.is_nil() {
                list.last.store(link.raw(), Ordering::Relaxed);
            } else {
                (*self.chunk_at(old_first.offset())).free_prev = link.raw();
            }
        }
        list.first.store(link.raw(), Ordering::Relaxed);
    }

    /// Push a free chunk onto the back of its class list.
    ///
    /// # Safety
    ///
    /// Same contract as [`free_push_head`](Self::free_push_head).
    pub(crate) unsafe fn free_push_tail(&self, mclass: u32, chunk: *mut ChunkHeader) {
        let list = self.free_list(mclass);
        let link = Link::from_offset(self.offset_of(chunk));
        let old_last = Link::from_raw(list.last.load(Ordering::Relaxed));
        unsafe {
            (*chunk).free_next = Link::HEAD.raw();
            (*chunk).free_prev = if old_last.is_nil() {
                Link::HEAD.raw()
            } else {
                old_last.raw()
            };
            if old_last.is_nil() {
                list.first.store(link.raw(), Ordering::Relaxed);
            } else {
                (*self.chunk_at(old_last.offset())).free_next = link.raw();
            }
        }
        list.last.store(link.raw(), Ordering::Relaxed);
    }

    /// Detach a chunk from its class free list and nil its links.
    ///
    /// # Safety
    ///
    /// Caller holds the segment spinlock; `chunk` is currently on the free
    /// list matching its header class.
    pub(crate) unsafe fn free_unlink(&self, chunk: *mut ChunkHeader) {
        unsafe {
            let list = self.free_list((*chunk).mclass);
            let prev = Link::from_raw((*chunk).free_prev);
            let next = Link::from_raw((*chunk).free_next);
            debug_assert!(!prev.is_nil() && !next.is_nil());
            if prev.is_head() {
                let raw = if next.is_head() { Link::NIL } else { next };
                list.first.store(raw.raw(), Ordering::Relaxed);
            } else {
                (*self.chunk_at(prev.offset())).free_next = next.raw();
            }
            if next.is_head() {
                let raw = if prev.is_head() { Link::NIL } else { prev };
                list.last.store(raw.raw(), Ordering::Relaxed);
            } else {
                (*self.chunk_at(next.offset())).free_prev = prev.raw();
            }
            (*chunk).free_prev = Link::NIL.raw();
            (*chunk).free_next = Link::NIL.raw();
        }
    }

    /// Pop the first free chunk of a class, if any.
    ///
    /// # Safety
    ///
    /// Caller holds the segment spinlock.
    pub(crate) unsafe fn free_pop_head(&self, mclass: u32) -> Option<*mut ChunkHeader> {
        let first = Link::from_raw(self.free_list(mclass).first.load(Ordering::Relaxed));
        if first.is_nil() {
            return None;
        }
        let chunk = self.chunk_at(first.offset());
        unsafe { self.free_unlink(chunk) };
        Some(chunk)
    }
}
