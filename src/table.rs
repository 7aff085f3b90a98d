//! The shared segment table and the per-process local map.
//!
//! The control region is one shared-memory object laid out as a
//! [`TableShared`] header followed by `nsegs` [`SegmentShared`]
//! descriptors. Segments are threaded onto two intrusive lists (active and
//! inactive) through index links in the descriptors themselves; every
//! segment is on exactly one of the two at any time, and the active list
//! holds exactly the segments whose revision is odd.
//!
//! The table's reader-writer lock covers list membership: allocation walks
//! the active list under the shared side, segment creation and destruction
//! relink under the exclusive side.

use crate::chunk::align8;
use crate::segment::{SegmentShared, NO_SEGMENT};
use crate::sync::ShmRwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Stamp identifying a formatted control region.
pub(crate) const TABLE_MAGIC: u32 = 0x444D_4150;

/// Head of an index-linked segment list.
#[repr(C)]
pub(crate) struct ListHead {
    first: AtomicU32,
    last: AtomicU32,
}

impl ListHead {
    fn new() -> Self {
        Self {
            first: AtomicU32::new(NO_SEGMENT),
            last: AtomicU32::new(NO_SEGMENT),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first.load(Ordering::Relaxed) == NO_SEGMENT
    }
}

/// Header of the control region.
#[repr(C)]
pub(crate) struct TableShared {
    pub(crate) magic: u32,
    pub(crate) nsegs: u32,
    pub(crate) seg_size: u64,
    /// Reservation base recorded by the creator; fork-descendants inherit
    /// the same base, so this doubles as a sanity check.
    pub(crate) v_base: u64,
    /// Guards active/inactive list membership.
    pub(crate) mutex: ShmRwLock,
    pub(crate) active: ListHead,
    pub(crate) inactive: ListHead,
}

/// Byte offset of the descriptor array within the control region.
pub(crate) fn segments_offset() -> usize {
    align8(std::mem::size_of::<TableShared>())
}

/// Total control-region size for `nsegs` descriptors.
pub(crate) fn control_region_size(nsegs: u32) -> usize {
    segments_offset() + nsegs as usize * std::mem::size_of::<SegmentShared>()
}

/// Borrowed view of a mapped control region.
#[derive(Clone, Copy)]
pub(crate) struct TableRef<'a> {
    pub(crate) head: &'a TableShared,
    segs: *mut SegmentShared,
}

impl<'a> TableRef<'a> {
    /// # Safety
    ///
    /// `base` must point at a live mapping of a control region formatted
    /// by [`init_control_region`], valid for `'a`.
    pub(crate) unsafe fn from_base(base: *mut u8) -> TableRef<'a> {
        unsafe {
            TableRef {
                head: &*base.cast::<TableShared>(),
                segs: base.add(segments_offset()).cast(),
            }
        }
    }

    pub(crate) fn segment(&self, idx: u32) -> &'a SegmentShared {
        debug_assert!(idx < self.head.nsegs);
        unsafe { &*self.segs.add(idx as usize) }
    }

    /// Push a segment onto the front of a list. Caller holds the table
    /// lock exclusively.
    pub(crate) fn push_head(&self, list: &ListHead, idx: u32) {
        let seg = self.segment(idx);
        let old_first = list.first.load(Ordering::Relaxed);
        seg.chain_prev.store(NO_SEGMENT, Ordering::Relaxed);
        seg.chain_next.store(old_first, Ordering::Relaxed);
        if old_first == NO_SEGMENT {
            list.last.store(idx, Ordering::Relaxed);
        } else {
            self.segment(old_first).chain_prev.store(idx, Ordering::Relaxed);
        }
        list.first.store(idx, Ordering::Relaxed);
    }

    /// Push a segment onto the back of a list. Caller holds the table
    /// lock exclusively.
    pub(crate) fn push_tail(&self, list: &ListHead, idx: u32) {
        let seg = self.segment(idx);
        let old_last = list.last.load(Ordering::Relaxed);
        seg.chain_next.store(NO_SEGMENT, Ordering::Relaxed);
        seg.chain_prev.store(old_last, Ordering::Relaxed);
        if old_last == NO_SEGMENT {
            list.first.store(idx, Ordering::Relaxed);
        } else {
            self.segment(old_last).chain_next.store(idx, Ordering::Relaxed);
        }
        list.last.store(idx, Ordering::Relaxed);
    }

    /// Unlink a segment from the list it is on. Caller holds the table
    /// lock exclusively.
    pub(crate) fn remove(&self, list: &ListHead, idx: u32) {
        let seg = self.segment(idx);
        let prev = seg.chain_prev.load(Ordering::Relaxed);
        let next = seg.chain_next.load(Ordering::Relaxed);
        if prev == NO_SEGMENT {
            list.first.store(next, Ordering::Relaxed);
        } else {
            self.segment(prev).chain_next.store(next, Ordering::Relaxed);
        }
        if next == NO_SEGMENT {
            list.last.store(prev, Ordering::Relaxed);
        } else {
            self.segment(next).chain_prev.store(prev, Ordering::Relaxed);
        }
        seg.chain_prev.store(NO_SEGMENT, Ordering::Relaxed);
        seg.chain_next.store(NO_SEGMENT, Ordering::Relaxed);
    }

    /// Pop the first segment of a list. Caller holds the table lock
    /// exclusively.
    pub(crate) fn pop_head(&self, list: &ListHead) -> Option<u32> {
        let first = list.first.load(Ordering::Relaxed);
        if first == NO_SEGMENT {
            return None;
        }
        self.remove(list, first);
        Some(first)
    }

    /// Iterate a list front to back. Caller holds the table lock at least
    /// shared.
    pub(crate) fn iter(&self, list: &ListHead) -> ListIter<'a> {
        ListIter {
            table: *self,
            cursor: list.first.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct ListIter<'a> {
    table: TableRef<'a>,
    cursor: u32,
}

impl Iterator for ListIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == NO_SEGMENT {
            return None;
        }
        let idx = self.cursor;
        self.cursor = self.table.segment(idx).chain_next.load(Ordering::Relaxed);
        Some(idx)
    }
}

/// Format a zeroed control region: write the header, construct every
/// descriptor and thread them all onto the inactive list.
///
/// # Safety
///
/// `base` points at writable memory of at least
/// [`control_region_size`]`(nsegs)` bytes not yet shared with any other
/// process or thread.
pub(crate) unsafe fn init_control_region(
    base: *mut u8,
    nsegs: u32,
    seg_size: usize,
    v_base: usize,
    persistent: u32,
) {
    unsafe {
        base.cast::<TableShared>().write(TableShared {
            magic: TABLE_MAGIC,
            nsegs,
            seg_size: seg_size as u64,
            v_base: v_base as u64,
            mutex: ShmRwLock::new(),
            active: ListHead::new(),
            inactive: ListHead::new(),
        });
        let segs = base.add(segments_offset()).cast::<SegmentShared>();
        let table = TableRef::from_base(base);
        for i in 0..nsegs {
            segs.add(i as usize).write(SegmentShared::new(i, i < persistent));
            table.push_tail(&table.head.inactive, i);
        }
    }
}

/// Per-process record of one segment slot's mapping state.
///
/// Written by the attach/detach paths and by the fault handler, which is
/// why the fields are atomics rather than plain values.
pub(crate) struct LocalMapEntry {
    /// Revision observed when this process last mapped the slot.
    pub(crate) revision: AtomicU32,
    /// True while the slot is file-backed in this process.
    pub(crate) attached: AtomicBool,
}

pub(crate) fn new_local_map(nsegs: u32) -> Box<[LocalMapEntry]> {
    (0..nsegs)
        .map(|_| LocalMapEntry {
            revision: AtomicU32::new(0),
            attached: AtomicBool::new(false),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_table(nsegs: u32) -> (Vec<u64>, TableRef<'static>) {
        let mut backing = vec![0u64; control_region_size(nsegs).div_ceil(8)];
        let base = backing.as_mut_ptr().cast::<u8>();
        unsafe {
            init_control_region(base, nsegs, 1 << 28, 0, 1);
            (backing, TableRef::from_base(base))
        }
    }

    #[test]
    fn test_init_populates_inactive_list() {
        let (_backing, table) = scratch_table(4);
        assert_eq!(table.head.magic, TABLE_MAGIC);
        assert!(table.head.active.is_empty());
        let order: Vec<_> = table.iter(&table.head.inactive).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(table.segment(0).is_persistent());
        assert!(!table.segment(1).is_persistent());
    }

    #[test]
    fn test_pop_and_push_between_lists() {
        let (_backing, table) = scratch_table(3);

        let idx = table.pop_head(&table.head.inactive).unwrap();
        assert_eq!(idx, 0);
        table.push_head(&table.head.active, idx);

        let active: Vec<_> = table.iter(&table.head.active).collect();
        let inactive: Vec<_> = table.iter(&table.head.inactive).collect();
        assert_eq!(active, vec![0]);
        assert_eq!(inactive, vec![1, 2]);
    }

    #[test]
    fn test_remove_middle() {
        let (_backing, table) = scratch_table(3);
        table.remove(&table.head.inactive, 1);
        let order: Vec<_> = table.iter(&table.head.inactive).collect();
        assert_eq!(order, vec![0, 2]);

        table.push_tail(&table.head.inactive, 1);
        let order: Vec<_> = table.iter(&table.head.inactive).collect();
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn test_lists_stay_a_partition() {
        let (_backing, table) = scratch_table(5);
        for _ in 0..3 {
            let idx = table.pop_head(&table.head.inactive).unwrap();
            table.push_head(&table.head.active, idx);
        }
        let idx = table.iter(&table.head.active).last().unwrap();
        table.remove(&table.head.active, idx);
        table.push_head(&table.head.inactive, idx);

        let mut seen: Vec<_> = table
            .iter(&table.head.active)
            .chain(table.iter(&table.head.inactive))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
