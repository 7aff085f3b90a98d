//! Buddy split/merge over one segment's free lists.
//!
//! Chunks are power-of-two sized and power-of-two aligned within their
//! segment, so the buddy of a chunk at offset `o` and class `m` is at
//! `o ^ (1 << m)`. The segment need not be a power of two itself: both the
//! initial formatting and the merge path bounds-check against the real
//! segment size, and a buddy beyond the end simply does not exist.
//!
//! Everything here runs under the segment spinlock except [`format`],
//! which runs on a segment no other process can see yet (its revision is
//! still even).

use crate::chunk::{
    init_free, write_tail_magic, ChunkHeader, Link, CHUNK_MAGIC, MAX_CLASS, MIN_CLASS,
};
use crate::error::{Error, Result};
use crate::segment::SegmentView;
use std::sync::atomic::Ordering;

/// Is the chunk on a free list?
///
/// # Safety
///
/// `chunk` must point at a readable chunk header.
pub(crate) unsafe fn chunk_is_free(chunk: *const ChunkHeader) -> bool {
    unsafe {
        !Link::from_raw((*chunk).free_prev).is_nil() && !Link::from_raw((*chunk).free_next).is_nil()
    }
}

/// Format a freshly attached segment: pack the whole range with
/// maximal-class free chunks, largest first.
///
/// # Safety
///
/// The segment must be mapped read-write in this process and invisible to
/// other processes (revision still even).
pub(crate) unsafe fn format(view: &SegmentView<'_>) {
    view.reset_free_lists();
    let mut offset = 0;
    let mut mclass = MAX_CLASS;
    while mclass >= MIN_CLASS && offset < view.size {
        if offset + (1usize << mclass) > view.size {
            mclass -= 1;
            continue;
        }
        let chunk = view.chunk_at(offset);
        unsafe {
            init_free(chunk, mclass);
            view.free_push_head(mclass, chunk);
        }
        offset += 1usize << mclass;
    }
    view.seg.num_chunks.store(0, Ordering::Relaxed);
}

/// Ensure a free chunk of class `mclass` exists, splitting larger chunks
/// as needed. Fails only when `mclass > MAX_CLASS` or the segment has no
/// free chunk of any class `>= mclass`.
///
/// # Safety
///
/// Caller holds the segment spinlock.
unsafe fn split(view: &SegmentView<'_>, mclass: u32) -> bool {
    if mclass > MAX_CLASS {
        return false;
    }
    if !view.free_is_empty(mclass) {
        return true;
    }
    if !unsafe { split(view, mclass + 1) } {
        return false;
    }
    unsafe {
        let chunk = match view.free_pop_head(mclass + 1) {
            Some(chunk) => chunk,
            None => return false,
        };
        debug_assert_eq!((*chunk).mclass, mclass + 1);
        debug_assert_eq!((*chunk).magic_head, CHUNK_MAGIC);

        // Earlier half keeps the address, later half is its buddy.
        init_free(chunk, mclass);
        view.free_push_tail(mclass, chunk);
        let buddy = view.chunk_at(view.offset_of(chunk) + (1usize << mclass));
        init_free(buddy, mclass);
        view.free_push_tail(mclass, buddy);
    }
    true
}

/// Allocate one chunk of exactly class `mclass`. Returns `None` when the
/// segment cannot satisfy the class (no-fit).
pub(crate) fn alloc_chunk(
    view: &SegmentView<'_>,
    mclass: u32,
    required: usize,
) -> Option<*mut ChunkHeader> {
    debug_assert!((MIN_CLASS..=MAX_CLASS).contains(&mclass));
    let _guard = view.seg.lock.lock();
    unsafe {
        if !split(view, mclass) {
            return None;
        }
        let chunk = view.free_pop_head(mclass)?;
        debug_assert_eq!((*chunk).mclass, mclass);
        debug_assert_eq!((*chunk).magic_head, CHUNK_MAGIC);

        (*chunk).owner_id = 0;
        (*chunk).required = required as u64;
        (*chunk).magic_head = CHUNK_MAGIC;
        write_tail_magic(chunk);
        view.seg.num_chunks.fetch_add(1, Ordering::Relaxed);
        Some(chunk)
    }
}

/// Return a detached chunk to the free lists, merging with free buddies as
/// far as possible. The surviving chunk is always the one at the lower
/// offset.
///
/// # Safety
///
/// Caller holds the segment spinlock. The chunk must be valid, off every
/// list, and its owner links already nil.
pub(crate) unsafe fn free_merge(view: &SegmentView<'_>, chunk: *mut ChunkHeader) {
    let mut chunk = chunk;
    unsafe {
        loop {
            let mclass = (*chunk).mclass;
            if mclass >= MAX_CLASS {
                break;
            }
            let offset = view.offset_of(chunk);
            let buddy_offset = offset ^ (1usize << mclass);
            if buddy_offset + (1usize << mclass) > view.size {
                break;
            }
            let buddy = view.chunk_at(buddy_offset);
            debug_assert_eq!((*buddy).magic_head, CHUNK_MAGIC);
            if (*buddy).mclass != mclass || !chunk_is_free(buddy) {
                break;
            }
            view.free_unlink(buddy);
            let keep = view.chunk_at(offset.min(buddy_offset));
            init_free(keep, mclass + 1);
            chunk = keep;
        }
        (*chunk).required = 0;
        (*chunk).owner_id = 0;
        let mclass = (*chunk).mclass;
        view.free_push_head(mclass, chunk);
    }
    view.seg.num_chunks.fetch_sub(1, Ordering::Relaxed);
}

/// Shrink an active chunk in place to a smaller class and carve the freed
/// tail into free chunks.
///
/// The carved fragments cannot merge with the surviving prefix (their
/// buddies of equal class are the prefix side, which is active), so they
/// go straight onto the free lists.
///
/// # Safety
///
/// Caller holds the segment spinlock; `new_class < (*chunk).mclass` and
/// the new footprint fits `required`.
pub(crate) unsafe fn shrink(
    view: &SegmentView<'_>,
    chunk: *mut ChunkHeader,
    new_class: u32,
    required: usize,
) {
    unsafe {
        let old_class = (*chunk).mclass;
        debug_assert!(new_class >= MIN_CLASS && new_class < old_class);

        (*chunk).mclass = new_class;
        (*chunk).required = required as u64;
        write_tail_magic(chunk);

        let head = view.offset_of(chunk) + (1usize << new_class);
        let mut tail = view.offset_of(chunk) + (1usize << old_class);
        let mut shift = old_class;
        while shift >= new_class {
            if head + (1usize << shift) > tail {
                shift -= 1;
                continue;
            }
            let frag = view.chunk_at(tail - (1usize << shift));
            init_free(frag, shift);
            view.free_push_head(shift, frag);
            tail -= 1usize << shift;
        }
        debug_assert_eq!(head, tail);
    }
}

/// Visit every chunk of the segment in address order.
///
/// # Safety
///
/// Caller holds the segment spinlock and the segment is mapped.
pub(crate) unsafe fn walk_chunks<F>(view: &SegmentView<'_>, mut visit: F) -> Result<()>
where
    F: FnMut(*mut ChunkHeader, usize) -> Result<()>,
{
    let mut offset = 0;
    while offset < view.size {
        let chunk = view.chunk_at(offset);
        let mclass = unsafe { (*chunk).mclass };
        if !(MIN_CLASS..=MAX_CLASS).contains(&mclass) {
            return Err(Error::Corrupted(format!(
                "chunk at offset {offset} has impossible class {mclass}"
            )));
        }
        visit(chunk, offset)?;
        offset += 1usize << mclass;
    }
    Ok(())
}
