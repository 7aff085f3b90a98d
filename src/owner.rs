//! Allocation owners.
//!
//! Every chunk is owned by exactly one [`BufferOwner`] at a time: the chunk
//! header carries the owner's id and sits on the owner's intrusive chunk
//! list (links are reservation-relative offsets, so the list structure in
//! shared memory is position-independent). The owner handle itself is
//! process-private; freeing a chunk therefore has to happen in the process
//! that created its owner.
//!
//! Dropping the last handle to an owner frees every chunk it still holds.

use crate::chunk::{ChunkHeader, Link};
use crate::pool::PoolShared;
use crate::sync::Spinlock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Handle to an allocation owner. Clones share the same owner.
#[derive(Clone)]
pub struct BufferOwner {
    pub(crate) inner: Arc<OwnerInner>,
}

impl BufferOwner {
    /// Identifier stored in the headers of this owner's chunks.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of chunks currently owned.
    pub fn chunk_count(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BufferOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferOwner")
            .field("id", &self.id())
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

pub(crate) struct OwnerInner {
    pub(crate) id: u64,
    pub(crate) lock: Spinlock,
    /// Encoded reservation-relative links to the first/last owned chunk.
    first: AtomicU64,
    last: AtomicU64,
    pub(crate) count: AtomicU64,
    pub(crate) pool: Weak<PoolShared>,
}

fn chunk_at(v_base: *mut u8, link: Link) -> *mut ChunkHeader {
    unsafe { v_base.add(link.offset()).cast() }
}

impl OwnerInner {
    pub(crate) fn new(id: u64, pool: Weak<PoolShared>) -> Self {
        Self {
            id,
            lock: Spinlock::new(),
            first: AtomicU64::new(Link::NIL.raw()),
            last: AtomicU64::new(Link::NIL.raw()),
            count: AtomicU64::new(0),
            pool,
        }
    }

    /// Append a freshly allocated chunk to this owner's list and stamp the
    /// back-pointer.
    ///
    /// # Safety
    ///
    /// `chunk` is a valid active chunk inside the reservation at `v_base`,
    /// currently on no owner list.
    pub(crate) unsafe fn attach(&self, v_base: *mut u8, chunk: *mut ChunkHeader) {
        let _guard = self.lock.lock();
        let link = Link::from_offset(chunk as usize - v_base as usize);
        let old_last = Link::from_raw(self.last.load(Ordering::Relaxed));
        unsafe {
            (*chunk).owner_next = Link::HEAD.raw();
            (*chunk).owner_prev = if old_last.is_nil() {
                Link::HEAD.raw()
            } else {
                old_last.raw()
            };
            (*chunk).owner_id = self.id;
            if old_last.is_nil() {
                self.first.store(link.raw(), Ordering::Relaxed);
            } else {
                (*chunk_at(v_base, old_last)).owner_next = link.raw();
            }
        }
        self.last.store(link.raw(), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Unlink a chunk from this owner's list and clear the back-pointer.
    ///
    /// # Safety
    ///
    /// `chunk` is a valid active chunk on this owner's list.
    pub(crate) unsafe fn detach(&self, v_base: *mut u8, chunk: *mut ChunkHeader) {
        let _guard = self.lock.lock();
        unsafe {
            let prev = Link::from_raw((*chunk).owner_prev);
            let next = Link::from_raw((*chunk).owner_next);
            debug_assert!(!prev.is_nil() && !next.is_nil());
            if prev.is_head() {
                let raw = if next.is_head() { Link::NIL } else { next };
                self.first.store(raw.raw(), Ordering::Relaxed);
            } else {
                (*chunk_at(v_base, prev)).owner_next = next.raw();
            }
            if next.is_head() {
                let raw = if prev.is_head() { Link::NIL } else { prev };
                self.last.store(raw.raw(), Ordering::Relaxed);
            } else {
                (*chunk_at(v_base, next)).owner_prev = prev.raw();
            }
            (*chunk).owner_prev = Link::NIL.raw();
            (*chunk).owner_next = Link::NIL.raw();
            (*chunk).owner_id = 0;
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    /// First chunk on the list, if any.
    pub(crate) fn peek_first(&self, v_base: *mut u8) -> Option<*mut ChunkHeader> {
        let _guard = self.lock.lock();
        let first = Link::from_raw(self.first.load(Ordering::Relaxed));
        if first.is_nil() {
            None
        } else {
            Some(chunk_at(v_base, first))
        }
    }
}

impl Drop for OwnerInner {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        pool.forget_owner(self.id);
        let remaining = self.count.load(Ordering::Relaxed);
        if remaining > 0 {
            tracing::debug!(owner = self.id, chunks = remaining, "releasing chunks of dropped owner");
            if let Err(e) = pool.free_chunks_of(self) {
                tracing::warn!(owner = self.id, error = %e, "failed to release chunks of dropped owner");
            }
        }
    }
}
