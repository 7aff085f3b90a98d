//! On-demand segment attachment from the SIGSEGV/SIGBUS handler.
//!
//! A process touching a segment slot it has not mapped (or a ghost mapping
//! whose object was dropped) takes a fault. If the faulting address lies
//! inside the pool's reservation and the segment's revision says the
//! object exists, the handler maps the current incarnation over the slot
//! and returns, letting the faulting instruction re-execute against live
//! memory. Anything else chains to the previously installed handler, which
//! is the host's normal crash path.
//!
//! Only async-signal-safe facilities are used here: atomics, raw libc
//! syscalls, the pre-sized name formatter, and `write(2)` to stderr. No
//! heap, no `tracing`.

use crate::error::{Error, Result};
use crate::pin::DevicePinner;
use crate::pool::PoolShared;
use crate::segment::revision_exists;
use crate::shm::ShmName;
use crate::table::{LocalMapEntry, TableRef};
use std::cell::Cell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Once, OnceLock};

/// Everything the handler needs, flattened out of `PoolShared` so the
/// signal path does no pointer chasing through Rust containers.
pub(crate) struct FaultState {
    v_base: usize,
    reservation_len: usize,
    seg_size: usize,
    namespace: u32,
    table_base: *mut u8,
    local: *const LocalMapEntry,
    pinner: Option<*const dyn DevicePinner>,
}

// SAFETY: the pointers target the pool's stable heap/mmap allocations and
// are only dereferenced while the owning pool is registered.
unsafe impl Send for FaultState {}
unsafe impl Sync for FaultState {}

impl FaultState {
    fn from_pool(pool: &PoolShared) -> Self {
        FaultState {
            v_base: pool.reservation.ptr() as usize,
            reservation_len: pool.reservation.len(),
            seg_size: pool.cfg.segment_size,
            namespace: pool.cfg.namespace,
            table_base: pool.ctl.ptr(),
            local: pool.local.as_ptr(),
            pinner: pool
                .pinner
                .as_ref()
                .map(|p| &**p as *const dyn DevicePinner),
        }
    }
}

/// The one pool per process the handler resolves faults for.
static REGISTERED: AtomicPtr<FaultState> = AtomicPtr::new(null_mut());

struct SavedAction(libc::sigaction);

// SAFETY: written once under `INSTALL`, read-only afterwards.
unsafe impl Send for SavedAction {}
unsafe impl Sync for SavedAction {}

static OLD_SEGV: OnceLock<SavedAction> = OnceLock::new();
static OLD_BUS: OnceLock<SavedAction> = OnceLock::new();
static INSTALL: Once = Once::new();
static INSTALL_OK: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Reentrancy guard: a fault raised while handling a fault is real.
    static IN_FAULT: Cell<bool> = const { Cell::new(false) };
}

/// Register `pool` as this process's fault-resolution target and install
/// the signal handlers (first registration only).
pub(crate) fn register(pool: &Arc<PoolShared>) -> Result<()> {
    // Park the state in its final home first; the handler dereferences the
    // raw pointer published below, so the box must never move again.
    if pool
        .fault_slot
        .set(Box::new(FaultState::from_pool(pool)))
        .is_err()
    {
        return Err(Error::HandlerInUse);
    }
    let Some(state) = pool.fault_slot.get() else {
        return Err(Error::HandlerInUse);
    };
    let raw = &**state as *const FaultState as *mut FaultState;
    if REGISTERED
        .compare_exchange(null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(Error::HandlerInUse);
    }
    if let Err(e) = install_handlers() {
        let _ = REGISTERED.compare_exchange(raw, null_mut(), Ordering::AcqRel, Ordering::Acquire);
        return Err(e);
    }
    Ok(())
}

/// Release the fault-resolution slot if `pool` holds it. The signal
/// dispositions stay installed; with no registered pool the handler just
/// chains.
pub(crate) fn unregister(pool: &PoolShared) {
    if let Some(state) = pool.fault_slot.get() {
        let raw = &**state as *const FaultState as *mut FaultState;
        let _ = REGISTERED.compare_exchange(raw, null_mut(), Ordering::AcqRel, Ordering::Acquire);
    }
}

fn install_handlers() -> Result<()> {
    INSTALL.call_once(|| unsafe {
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            on_fault;
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigfillset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_SIGINFO;

        let mut old_segv: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &sa, &mut old_segv) != 0 {
            return;
        }
        let mut old_bus: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGBUS, &sa, &mut old_bus) != 0 {
            return;
        }
        let _ = OLD_SEGV.set(SavedAction(old_segv));
        let _ = OLD_BUS.set(SavedAction(old_bus));
        INSTALL_OK.store(true, Ordering::Release);
    });
    if INSTALL_OK.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::last_os_error()))
    }
}

extern "C" fn on_fault(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let handled = IN_FAULT.with(|flag| {
        if flag.get() {
            return false;
        }
        flag.set(true);
        // SAFETY: info comes from the kernel with SA_SIGINFO set.
        let handled = unsafe { try_resolve(info) };
        flag.set(false);
        handled
    });
    if handled {
        return;
    }
    // SAFETY: chaining reproduces the pre-installation disposition.
    unsafe { chain_previous(signum, info, ctx) };
}

/// Attempt to resolve the fault by attaching the current incarnation of
/// the segment under the faulting address.
///
/// # Safety
///
/// `info` must be a live kernel-provided `siginfo_t` for a memory fault.
unsafe fn try_resolve(info: *mut libc::siginfo_t) -> bool {
    unsafe {
        let state_ptr = REGISTERED.load(Ordering::Acquire);
        if state_ptr.is_null() {
            return false;
        }
        let state = &*state_ptr;
        let addr = (*info).si_addr() as usize;
        if addr < state.v_base || addr >= state.v_base + state.reservation_len {
            return false;
        }
        let errno = libc::__errno_location();
        let saved_errno = *errno;
        let resolved = attach_on_demand(state, addr);
        *errno = saved_errno;
        resolved
    }
}

/// # Safety
///
/// `state` is the registered fault state and `addr` lies inside its
/// reservation.
unsafe fn attach_on_demand(state: &FaultState, addr: usize) -> bool {
    unsafe {
        let seg_id = ((addr - state.v_base) / state.seg_size) as u32;
        let table: TableRef<'_> = TableRef::from_base(state.table_base);
        let seg = table.segment(seg_id);
        let base = (state.v_base + seg_id as usize * state.seg_size) as *mut u8;

        let revision = seg.revision.load(Ordering::Acquire);
        if !revision_exists(revision) {
            // Nobody maps addresses into a segment that does not exist;
            // this is a stray pointer, not a lazy attach.
            write_stderr(b"dmapool: fault on non-resident segment\n");
            return false;
        }

        let local = &*state.local.add(seg_id as usize);
        if local.attached.load(Ordering::Relaxed) {
            if local.revision.load(Ordering::Relaxed) == revision {
                write_stderr(b"dmapool: fault inside an attached segment\n");
                return false;
            }
            // Stale incarnation: drop it before mapping the current one.
            if let Some(pinner) = state.pinner {
                if (*pinner).unpin(base, state.seg_size).is_err() {
                    write_stderr(b"dmapool: unpin of stale segment failed\n");
                    return false;
                }
            }
            if libc::munmap(base.cast(), state.seg_size) != 0 {
                write_stderr(b"dmapool: munmap of stale segment failed\n");
                return false;
            }
            local.attached.store(false, Ordering::Relaxed);
        }

        let name = ShmName::segment(state.namespace, seg_id, revision);
        let fd = libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o600);
        if fd < 0 {
            write_stderr(b"dmapool: shm_open failed for ");
            write_stderr(name.as_cstr().to_bytes());
            write_stderr(b"\n");
            return false;
        }
        // The creator already sized the object; no ftruncate here.
        let mapped = libc::mmap(
            base.cast(),
            state.seg_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        );
        libc::close(fd);
        if mapped != base.cast() {
            write_stderr(b"dmapool: mmap failed for ");
            write_stderr(name.as_cstr().to_bytes());
            write_stderr(b"\n");
            return false;
        }

        if let Some(pinner) = state.pinner {
            if (*pinner).pin(base, state.seg_size).is_err() {
                write_stderr(b"dmapool: pin of attached segment failed\n");
                return false;
            }
        }

        local.revision.store(revision, Ordering::Relaxed);
        local.attached.store(true, Ordering::Relaxed);
        true
    }
}

/// Invoke whatever disposition was installed before ours.
///
/// # Safety
///
/// Must be called from signal context with the original `info`/`ctx`.
unsafe fn chain_previous(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let saved = match signum {
        libc::SIGSEGV => OLD_SEGV.get(),
        libc::SIGBUS => OLD_BUS.get(),
        _ => None,
    };
    unsafe {
        match saved {
            Some(SavedAction(old)) if old.sa_flags & libc::SA_SIGINFO != 0 => {
                let previous: extern "C" fn(
                    libc::c_int,
                    *mut libc::siginfo_t,
                    *mut libc::c_void,
                ) = std::mem::transmute(old.sa_sigaction);
                previous(signum, info, ctx);
            }
            Some(SavedAction(old)) if old.sa_sigaction == libc::SIG_IGN => {}
            Some(SavedAction(old))
                if old.sa_sigaction != libc::SIG_DFL && old.sa_sigaction != 0 =>
            {
                let previous: extern "C" fn(libc::c_int) =
                    std::mem::transmute(old.sa_sigaction);
                previous(signum);
            }
            _ => reset_to_default(signum),
        }
    }
}

/// Restore the default disposition and return; the faulting instruction
/// re-executes and the default action (core dump) fires.
///
/// # Safety
///
/// Signal context only.
unsafe fn reset_to_default(signum: libc::c_int) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signum, &sa, null_mut());
    }
}

fn write_stderr(msg: &[u8]) {
    // Best effort; there is nothing to do about a failed write here.
    unsafe {
        let _ = libc::write(2, msg.as_ptr().cast(), msg.len());
    }
}
