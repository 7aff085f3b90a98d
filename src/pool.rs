//! The pool façade.
//!
//! A [`DmaBufferPool`] owns one control region (segment table), one virtual
//! reservation covering every segment slot, and the per-process local map.
//! Allocation walks the active segments under the shared side of the table
//! lock and only escalates to the exclusive side to create or destroy a
//! segment, so the fast path contends on per-segment spinlocks alone.

use crate::attach::{map_control_region, reserve_address_range, Mapping};
use crate::buddy;
use crate::chunk::{
    self, payload_of, read_tail_magic, size_class, ChunkHeader, Link, CHUNK_MAGIC, HEADER_LEN,
    MAX_CLASS, MIN_CLASS, POISON_ALLOC, POISON_FREE, TAIL_LEN,
};
use crate::config::{PoolConfig, ResolvedConfig};
use crate::error::{Error, Result};
use crate::fault::{self, FaultState};
use crate::owner::{BufferOwner, OwnerInner};
use crate::pin::DevicePinner;
use crate::segment::{revision_exists, SegmentView};
use crate::shm::{self, ShmName};
use crate::table::{
    control_region_size, init_control_region, new_local_map, LocalMapEntry, TableRef,
};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

/// Per-class chunk counts of one active segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassReport {
    /// log2 of the chunk size.
    pub mclass: u32,
    /// Chunks of this class currently allocated.
    pub active: u32,
    /// Chunks of this class on the free list.
    pub free: u32,
}

/// Snapshot of one active segment, produced by
/// [`DmaBufferPool::segment_reports`].
#[derive(Debug, Clone)]
pub struct SegmentReport {
    /// Slot index of the segment.
    pub segment_id: u32,
    /// Revision at the time of the walk (always odd here).
    pub revision: u32,
    /// Whether the segment survives draining.
    pub persistent: bool,
    /// Number of allocated chunks.
    pub num_chunks: u32,
    /// Non-empty per-class counts, ascending by class.
    pub classes: Vec<ClassReport>,
}

pub(crate) struct PoolShared {
    pub(crate) cfg: ResolvedConfig,
    /// Mapping of the control-region object.
    pub(crate) ctl: Mapping,
    /// `PROT_NONE` reservation covering every segment slot.
    pub(crate) reservation: Mapping,
    pub(crate) local: Box<[LocalMapEntry]>,
    pub(crate) pinner: Option<Arc<dyn DevicePinner>>,
    owners: Mutex<HashMap<u64, Weak<OwnerInner>>>,
    next_owner_id: AtomicU64,
    creator_pid: u32,
    pub(crate) fault_slot: OnceLock<Box<FaultState>>,
}

// SAFETY: the raw mappings are shared memory whose contents are guarded by
// the in-memory locks; everything else is Sync by construction.
unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

impl PoolShared {
    pub(crate) fn table(&self) -> TableRef<'_> {
        // SAFETY: ctl maps a control region formatted at construction.
        unsafe { TableRef::from_base(self.ctl.ptr()) }
    }

    pub(crate) fn v_base(&self) -> *mut u8 {
        self.reservation.ptr()
    }

    pub(crate) fn seg_base(&self, idx: u32) -> *mut u8 {
        unsafe { self.v_base().add(idx as usize * self.cfg.segment_size) }
    }

    pub(crate) fn view_of(&self, idx: u32) -> SegmentView<'_> {
        SegmentView {
            seg: self.table().segment(idx),
            base: self.seg_base(idx),
            size: self.cfg.segment_size,
        }
    }

    fn lookup_owner(&self, id: u64) -> Option<Arc<OwnerInner>> {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .and_then(Weak::upgrade)
    }

    pub(crate) fn forget_owner(&self, id: u64) {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn new_owner(this: &Arc<Self>) -> BufferOwner {
        let id = this.next_owner_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(OwnerInner::new(id, Arc::downgrade(this)));
        this.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::downgrade(&inner));
        BufferOwner { inner }
    }

    /// Walk the active list and try each segment for a chunk of `mclass`.
    /// Caller holds the table lock at least shared.
    fn try_active_segments(
        &self,
        table: &TableRef<'_>,
        mclass: u32,
        required: usize,
    ) -> Option<(u32, *mut ChunkHeader)> {
        for idx in table.iter(&table.head.active) {
            debug_assert!(revision_exists(
                table.segment(idx).revision.load(Ordering::Acquire)
            ));
            let view = self.view_of(idx);
            if let Some(chunk) = buddy::alloc_chunk(&view, mclass, required) {
                return Some((idx, chunk));
            }
        }
        None
    }

    fn alloc_raw(&self, mclass: u32, required: usize) -> Result<(u32, *mut ChunkHeader)> {
        let table = self.table();
        {
            let _shared = table.head.mutex.read();
            if let Some(found) = self.try_active_segments(&table, mclass, required) {
                return Ok(found);
            }
        }
        // Exhausted under the shared lock. Reacquire exclusively and
        // re-walk: another process may have created a segment meanwhile.
        let _excl = table.head.mutex.write();
        if let Some(found) = self.try_active_segments(&table, mclass, required) {
            return Ok(found);
        }
        let idx = table
            .pop_head(&table.head.inactive)
            .ok_or(Error::OutOfSegments(self.cfg.max_segments))?;
        if let Err(e) = self.create_segment(idx) {
            table.push_head(&table.head.inactive, idx);
            return Err(e);
        }
        table.push_head(&table.head.active, idx);

        let view = self.view_of(idx);
        let chunk = buddy::alloc_chunk(&view, mclass, required).ok_or_else(|| {
            Error::Corrupted("freshly created segment could not satisfy allocation".into())
        })?;
        Ok((idx, chunk))
    }

    pub(crate) fn alloc(&self, owner: &OwnerInner, required: usize) -> Result<NonNull<u8>> {
        let mclass = size_class(required, self.cfg.segment_size)?;
        let (_idx, chunk) = self.alloc_raw(mclass, required)?;
        // SAFETY: chunk is a fresh active chunk inside the reservation.
        unsafe {
            owner.attach(self.v_base(), chunk);
            let payload = payload_of(chunk);
            if self.cfg.poison {
                std::ptr::write_bytes(payload, POISON_ALLOC, required);
            }
            Ok(NonNull::new_unchecked(payload))
        }
    }

    /// Detach a validated chunk from its owner, merge it back into its
    /// segment, and drop the segment when this was its last chunk.
    pub(crate) fn release_chunk(
        &self,
        owner: &OwnerInner,
        idx: u32,
        chunk: *mut ChunkHeader,
    ) -> Result<()> {
        let table = self.table();
        let seg = table.segment(idx);
        let view = self.view_of(idx);

        // SAFETY: validated active chunk; owner detach only touches owner
        // links, which the segment spinlock does not cover.
        unsafe {
            if self.cfg.poison {
                std::ptr::write_bytes(payload_of(chunk), POISON_FREE, (*chunk).required as usize);
            }
            owner.detach(self.v_base(), chunk);
        }

        // Dropping the last chunk moves the segment off the active list,
        // which needs the table lock. Taking it while holding the spinlock
        // would invert the hierarchy, so drop, escalate, re-check.
        let mut excl = None;
        loop {
            let spin = seg.lock.lock();
            if seg.num_chunks.load(Ordering::Relaxed) == 1
                && !seg.is_persistent()
                && excl.is_none()
            {
                drop(spin);
                excl = Some(table.head.mutex.write());
                continue;
            }

            // SAFETY: spinlock held, chunk is off every list.
            unsafe { buddy::free_merge(&view, chunk) };

            if seg.num_chunks.load(Ordering::Relaxed) == 0 && !seg.is_persistent() {
                debug_assert!(excl.is_some());
                self.destroy_segment(idx);
                drop(spin);
                table.remove(&table.head.active, idx);
                table.push_head(&table.head.inactive, idx);
            } else {
                drop(spin);
            }
            break;
        }
        drop(excl);
        Ok(())
    }

    pub(crate) fn free(&self, payload: *mut u8) -> Result<()> {
        let (idx, chunk) = self.validate_payload(payload)?;
        let owner_id = unsafe { (*chunk).owner_id };
        let owner = self.lookup_owner(owner_id).ok_or_else(|| {
            Error::Corrupted(format!(
                "chunk owner {owner_id} is not registered in this process"
            ))
        })?;
        self.release_chunk(&owner, idx, chunk)
    }

    /// Free every chunk on `owner`'s list.
    pub(crate) fn free_chunks_of(&self, owner: &OwnerInner) -> Result<()> {
        while let Some(chunk) = owner.peek_first(self.v_base()) {
            let (idx, chunk) = self.validate_payload(payload_of(chunk))?;
            self.release_chunk(owner, idx, chunk)?;
        }
        Ok(())
    }

    pub(crate) fn realloc(&self, payload: *mut u8, required: usize) -> Result<NonNull<u8>> {
        let (idx, chunk) = self.validate_payload(payload)?;
        let new_class = size_class(required, self.cfg.segment_size)?;
        let seg = self.table().segment(idx);

        // SAFETY: validated chunk; header mutations below follow the same
        // locking rules as the buddy paths.
        unsafe {
            let old_class = (*chunk).mclass;
            if new_class == old_class {
                (*chunk).required = required as u64;
                chunk::write_tail_magic(chunk);
                return Ok(NonNull::new_unchecked(payload));
            }
            if new_class < old_class {
                let view = self.view_of(idx);
                let _spin = seg.lock.lock();
                buddy::shrink(&view, chunk, new_class, required);
                return Ok(NonNull::new_unchecked(payload));
            }

            // Growing: a larger chunk elsewhere, copy, release the old one.
            let owner_id = (*chunk).owner_id;
            let owner = self.lookup_owner(owner_id).ok_or_else(|| {
                Error::Corrupted(format!(
                    "chunk owner {owner_id} is not registered in this process"
                ))
            })?;
            let old_required = (*chunk).required as usize;
            let new_payload = self.alloc(&owner, required)?;
            std::ptr::copy_nonoverlapping(payload, new_payload.as_ptr(), old_required);
            self.release_chunk(&owner, idx, chunk)?;
            Ok(new_payload)
        }
    }

    /// Validate a payload pointer against the in-band metadata and resolve
    /// it to its segment and header.
    pub(crate) fn validate_payload(&self, payload: *mut u8) -> Result<(u32, *mut ChunkHeader)> {
        let v_base = self.v_base() as usize;
        let seg_size = self.cfg.segment_size;
        let header_addr = (payload as usize)
            .checked_sub(HEADER_LEN)
            .filter(|a| (v_base..v_base + self.reservation.len()).contains(a))
            .ok_or_else(|| {
                Error::Corrupted(format!("{payload:p} is outside the buffer reservation"))
            })?;

        let idx = ((header_addr - v_base) / seg_size) as u32;
        let offset_in_segment = (header_addr - v_base) % seg_size;
        if offset_in_segment + HEADER_LEN + TAIL_LEN > seg_size {
            return Err(Error::Corrupted(format!(
                "{payload:p} overruns the end of segment {idx}"
            )));
        }

        let seg = self.table().segment(idx);
        if !revision_exists(seg.revision.load(Ordering::Acquire)) {
            return Err(Error::Corrupted(format!(
                "{payload:p} points into non-resident segment {idx}"
            )));
        }

        let chunk = header_addr as *mut ChunkHeader;
        // SAFETY: the header lies inside a resident segment; an unmapped
        // slot in this process resolves through the fault handler.
        unsafe {
            let mclass = (*chunk).mclass;
            if !(MIN_CLASS..=MAX_CLASS).contains(&mclass) {
                return Err(Error::Corrupted(format!(
                    "{payload:p} has impossible chunk class {mclass}"
                )));
            }
            let required = (*chunk).required as usize;
            if HEADER_LEN + required + TAIL_LEN > 1usize << mclass {
                return Err(Error::Corrupted(format!(
                    "{payload:p} length {required} overruns its class-{mclass} chunk"
                )));
            }
            if (*chunk).magic_head != CHUNK_MAGIC || read_tail_magic(chunk) != CHUNK_MAGIC {
                return Err(Error::Corrupted(format!(
                    "{payload:p} has clobbered magic words"
                )));
            }
            if !Link::from_raw((*chunk).free_prev).is_nil()
                || !Link::from_raw((*chunk).free_next).is_nil()
            {
                return Err(Error::Corrupted(format!("{payload:p} points at a free chunk")));
            }
        }
        Ok((idx, chunk))
    }

    /// Sweep every invariant the structures promise. See the test suite.
    pub(crate) fn audit(&self) -> Result<()> {
        let table = self.table();
        let _shared = table.head.mutex.read();

        if table.head.magic != crate::table::TABLE_MAGIC {
            return Err(Error::Corrupted("control region magic clobbered".into()));
        }
        if table.head.nsegs != self.cfg.max_segments
            || table.head.seg_size != self.cfg.segment_size as u64
        {
            return Err(Error::Corrupted(
                "control region geometry disagrees with the configuration".into(),
            ));
        }
        if table.head.v_base != self.v_base() as u64 {
            return Err(Error::Corrupted(
                "reservation base differs from the creator's".into(),
            ));
        }

        let nsegs = self.cfg.max_segments as usize;
        let mut seen = vec![false; nsegs];
        for idx in table.iter(&table.head.active) {
            if std::mem::replace(&mut seen[idx as usize], true) {
                return Err(Error::Corrupted(format!("segment {idx} listed twice")));
            }
            let seg = table.segment(idx);
            if seg.segment_id != idx {
                return Err(Error::Corrupted(format!(
                    "segment {idx} carries id {}",
                    seg.segment_id
                )));
            }
            if !revision_exists(seg.revision.load(Ordering::Acquire)) {
                return Err(Error::Corrupted(format!(
                    "segment {idx} is active with an even revision"
                )));
            }
        }
        for idx in table.iter(&table.head.inactive) {
            if std::mem::replace(&mut seen[idx as usize], true) {
                return Err(Error::Corrupted(format!("segment {idx} listed twice")));
            }
            if revision_exists(table.segment(idx).revision.load(Ordering::Acquire)) {
                return Err(Error::Corrupted(format!(
                    "segment {idx} is inactive with an odd revision"
                )));
            }
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(Error::Corrupted(format!(
                "segment {missing} is on neither list"
            )));
        }

        for idx in table.iter(&table.head.active) {
            self.audit_segment(idx)?;
        }
        Ok(())
    }

    fn audit_segment(&self, idx: u32) -> Result<()> {
        let view = self.view_of(idx);
        let seg = view.seg;
        let _spin = seg.lock.lock();

        let mut covered = 0usize;
        let mut active_chunks = 0u32;
        // SAFETY: spinlock held; the creator process keeps every segment it
        // audits attached.
        unsafe {
            buddy::walk_chunks(&view, |chunk, offset| {
                let (mclass, free, owner_linked) = unsafe {
                    if (*chunk).magic_head != CHUNK_MAGIC {
                        return Err(Error::Corrupted(format!(
                            "segment {idx} offset {offset}: head magic clobbered"
                        )));
                    }
                    (
                        (*chunk).mclass,
                        buddy::chunk_is_free(chunk),
                        !Link::from_raw((*chunk).owner_prev).is_nil()
                            && !Link::from_raw((*chunk).owner_next).is_nil(),
                    )
                };
                if offset & ((1usize << mclass) - 1) != 0 {
                    return Err(Error::Corrupted(format!(
                        "segment {idx} offset {offset}: class-{mclass} chunk misaligned"
                    )));
                }
                covered += 1usize << mclass;
                match (free, owner_linked) {
                    (true, true) => {
                        return Err(Error::Corrupted(format!(
                            "segment {idx} offset {offset}: chunk on both lists"
                        )))
                    }
                    (false, false) => {
                        return Err(Error::Corrupted(format!(
                            "segment {idx} offset {offset}: chunk on neither list"
                        )))
                    }
                    (true, false) => {
                        // Full-merge invariant: a free chunk's equal-class
                        // buddy must not also be free.
                        let buddy_offset = offset ^ (1usize << mclass);
                        if mclass < MAX_CLASS && buddy_offset + (1usize << mclass) <= view.size {
                            let buddy = view.chunk_at(buddy_offset);
                            let buddy_free = unsafe {
                                (*buddy).mclass == mclass && buddy::chunk_is_free(buddy)
                            };
                            if buddy_free {
                                return Err(Error::Corrupted(format!(
                                    "segment {idx} offset {offset}: unmerged free buddies"
                                )));
                            }
                        }
                    }
                    (false, true) => {
                        active_chunks += 1;
                        let tail_ok = unsafe { read_tail_magic(chunk) == CHUNK_MAGIC };
                        if !tail_ok {
                            return Err(Error::Corrupted(format!(
                                "segment {idx} offset {offset}: tail magic clobbered"
                            )));
                        }
                    }
                }
                Ok(())
            })?;
        }
        if covered != view.size {
            return Err(Error::Corrupted(format!(
                "segment {idx}: chunk footprints cover {covered} of {} bytes",
                view.size
            )));
        }
        let recorded = seg.num_chunks.load(Ordering::Relaxed);
        if recorded != active_chunks {
            return Err(Error::Corrupted(format!(
                "segment {idx}: num_chunks says {recorded}, walk found {active_chunks}"
            )));
        }
        Ok(())
    }

    fn segment_reports(&self) -> Vec<SegmentReport> {
        let table = self.table();
        let _shared = table.head.mutex.read();
        let mut reports = Vec::new();
        for idx in table.iter(&table.head.active) {
            let view = self.view_of(idx);
            let seg = view.seg;
            let _spin = seg.lock.lock();
            let mut active = [0u32; chunk::NUM_CLASSES];
            let mut free = [0u32; chunk::NUM_CLASSES];
            // SAFETY: spinlock held, segment attached in this process.
            let walk = unsafe {
                buddy::walk_chunks(&view, |chunk, _| {
                    let (mclass, is_free) =
                        unsafe { ((*chunk).mclass as usize, buddy::chunk_is_free(chunk)) };
                    if is_free {
                        free[mclass] += 1;
                    } else {
                        active[mclass] += 1;
                    }
                    Ok(())
                })
            };
            if let Err(e) = walk {
                tracing::warn!(segment = idx, error = %e, "segment walk failed during report");
                continue;
            }
            let classes = (0..chunk::NUM_CLASSES)
                .filter(|&m| active[m] + free[m] > 0)
                .map(|m| ClassReport {
                    mclass: m as u32,
                    active: active[m],
                    free: free[m],
                })
                .collect();
            reports.push(SegmentReport {
                segment_id: idx,
                revision: seg.revision.load(Ordering::Acquire),
                persistent: seg.is_persistent(),
                num_chunks: seg.num_chunks.load(Ordering::Relaxed),
                classes,
            });
        }
        reports
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        fault::unregister(self);
        if std::process::id() != self.creator_pid {
            return;
        }
        // The creator is the last one out: drop every residual object so
        // nothing leaks into /dev/shm past the pool's lifetime.
        let table = self.table();
        let _excl = table.head.mutex.write();
        for idx in table.iter(&table.head.active) {
            let seg = table.segment(idx);
            let name = ShmName::segment(
                self.cfg.namespace,
                idx,
                seg.revision.load(Ordering::Acquire),
            );
            match shm::truncate_and_unlink(&name) {
                Ok(()) => tracing::debug!(segment = idx, name = %name, "residual segment dropped"),
                Err(e) => {
                    tracing::warn!(segment = idx, name = %name, error = %e, "failed to drop residual segment")
                }
            }
        }
        let ctl_name = ShmName::control(self.cfg.namespace);
        if let Err(e) = rustix::shm::shm_unlink(ctl_name.as_cstr()) {
            tracing::warn!(name = %ctl_name, error = %e, "failed to unlink control region");
        }
    }
}

/// Multi-process, host-pinned DMA buffer pool.
///
/// The pool hands out payload pointers into large shared-memory segments
/// managed by a buddy allocator. Segments are created on demand, pinned
/// for device DMA when a [`DevicePinner`] is bound, and released when they
/// drain (unless persistent). Cooperating processes are fork-descendants
/// of the creator and resolve segments they have not mapped yet through
/// the pool's fault handler.
///
/// # Example
///
/// ```rust,ignore
/// use dmapool::{DmaBufferPool, PoolConfig};
///
/// let pool = DmaBufferPool::new(PoolConfig::default())?;
/// let owner = pool.owner();
/// let ptr = pool.alloc(&owner, 4096)?;
/// assert_eq!(pool.size(ptr)?, 4096);
/// pool.free(ptr)?;
/// ```
#[derive(Clone)]
pub struct DmaBufferPool {
    shared: Arc<PoolShared>,
}

impl DmaBufferPool {
    /// Create a pool with no device binding.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Create a pool whose segments are pinned through `pinner` whenever
    /// they become resident in this process.
    pub fn with_pinner(config: PoolConfig, pinner: Arc<dyn DevicePinner>) -> Result<Self> {
        Self::build(config, Some(pinner))
    }

    fn build(config: PoolConfig, pinner: Option<Arc<dyn DevicePinner>>) -> Result<Self> {
        let cfg = config.resolve()?;

        let region_len = control_region_size(cfg.max_segments);
        let ctl_name = ShmName::control(cfg.namespace);
        let fd = shm::create_object(&ctl_name, region_len)?;
        let ctl = map_control_region(&fd, region_len)?;
        drop(fd);

        let reservation =
            reserve_address_range(cfg.max_segments as usize * cfg.segment_size)?;

        // SAFETY: freshly created zeroed region, not shared yet.
        unsafe {
            init_control_region(
                ctl.ptr(),
                cfg.max_segments,
                cfg.segment_size,
                reservation.ptr() as usize,
                cfg.persistent_segments,
            );
        }

        let local = new_local_map(cfg.max_segments);
        let install_handler = cfg.install_fault_handler;
        let shared = Arc::new(PoolShared {
            cfg,
            ctl,
            reservation,
            local,
            pinner,
            owners: Mutex::new(HashMap::new()),
            next_owner_id: AtomicU64::new(1),
            creator_pid: std::process::id(),
            fault_slot: OnceLock::new(),
        });

        if install_handler {
            fault::register(&shared)?;
        }

        tracing::info!(
            segment_size = shared.cfg.segment_size,
            max_segments = shared.cfg.max_segments,
            persistent_segments = shared.cfg.persistent_segments,
            namespace = shared.cfg.namespace,
            "buffer pool initialized"
        );
        Ok(Self { shared })
    }

    /// Create a new allocation owner.
    pub fn owner(&self) -> BufferOwner {
        PoolShared::new_owner(&self.shared)
    }

    /// Allocate `required` bytes for `owner`. Returns a payload pointer
    /// valid in every cooperating process.
    pub fn alloc(&self, owner: &BufferOwner, required: usize) -> Result<NonNull<u8>> {
        self.shared.alloc(&owner.inner, required)
    }

    /// Resize an allocation. The pointer is preserved when the size class
    /// does not grow; otherwise the contents move to a new chunk.
    pub fn realloc(&self, ptr: NonNull<u8>, required: usize) -> Result<NonNull<u8>> {
        self.shared.realloc(ptr.as_ptr(), required)
    }

    /// Free an allocation.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        self.shared.free(ptr.as_ptr())
    }

    /// Free every chunk currently held by `owner`.
    ///
    /// Concurrent allocation by the same owner must be serialized by the
    /// caller.
    pub fn free_all(&self, owner: &BufferOwner) -> Result<()> {
        self.shared.free_chunks_of(&owner.inner)
    }

    /// Length the caller asked for when allocating `ptr`.
    pub fn size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let (_, chunk) = self.shared.validate_payload(ptr.as_ptr())?;
        // SAFETY: validated above.
        Ok(unsafe { (*chunk).required as usize })
    }

    /// Physical footprint of the chunk backing `ptr` (always a power of
    /// two).
    pub fn chunk_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let (_, chunk) = self.shared.validate_payload(ptr.as_ptr())?;
        // SAFETY: validated above.
        Ok(1usize << unsafe { (*chunk).mclass })
    }

    /// Whether `ptr` is a valid, live payload pointer of this pool.
    pub fn validate(&self, ptr: *const u8) -> bool {
        self.shared.validate_payload(ptr.cast_mut()).is_ok()
    }

    /// Largest `required` a single allocation can ask for.
    pub fn max_alloc_size(&self) -> usize {
        chunk::max_alloc_size(self.shared.cfg.segment_size)
    }

    /// Bytes per segment.
    pub fn segment_size(&self) -> usize {
        self.shared.cfg.segment_size
    }

    /// Per-segment, per-class chunk counts for every active segment.
    pub fn segment_reports(&self) -> Vec<SegmentReport> {
        self.shared.segment_reports()
    }

    /// Verify every structural invariant of the pool. Returns the first
    /// violation as a corruption error.
    pub fn audit(&self) -> Result<()> {
        self.shared.audit()
    }
}

impl std::fmt::Debug for DmaBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBufferPool")
            .field("segment_size", &self.shared.cfg.segment_size)
            .field("max_segments", &self.shared.cfg.max_segments)
            .field("namespace", &self.shared.cfg.namespace)
            .finish()
    }
}
