//! Locks that live inside shared memory.
//!
//! Both primitives are a single `AtomicU32`, so they can sit in `#[repr(C)]`
//! structures mapped into several processes at once. The zero bit pattern is
//! the unlocked state, which matches the zero fill a fresh `ftruncate`d
//! object arrives with.

use std::sync::atomic::{AtomicU32, Ordering};

/// Test-and-set spinlock.
///
/// Critical sections guarded by this lock are a handful of pointer writes
/// (free-list relinking, chunk header updates), so spinning beats parking.
#[repr(transparent)]
pub(crate) struct Spinlock(AtomicU32);

impl Spinlock {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        loop {
            if self
                .0
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { lock: self };
            }
            while self.0.load(Ordering::Relaxed) != 0 {
                std::hint::spin_loop();
            }
        }
    }
}

pub(crate) struct SpinGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.0.store(0, Ordering::Release);
    }
}

const WRITER: u32 = 1 << 31;

/// Spinning reader-writer lock.
///
/// Low 31 bits count readers; the top bit is the writer. There is no
/// shared-to-exclusive upgrade: callers drop the read guard, reacquire
/// exclusively and re-verify what they saw, which is the only upgrade
/// protocol that cannot deadlock two upgraders against each other.
#[repr(transparent)]
pub(crate) struct ShmRwLock(AtomicU32);

impl ShmRwLock {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub(crate) fn read(&self) -> ReadGuard<'_> {
        loop {
            let v = self.0.load(Ordering::Relaxed);
            if v & WRITER == 0
                && self
                    .0
                    .compare_exchange_weak(v, v + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return ReadGuard { lock: self };
            }
            std::hint::spin_loop();
        }
    }

    pub(crate) fn write(&self) -> WriteGuard<'_> {
        loop {
            if self
                .0
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return WriteGuard { lock: self };
            }
            std::hint::spin_loop();
        }
    }
}

pub(crate) struct ReadGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.0.fetch_sub(1, Ordering::Release);
    }
}

pub(crate) struct WriteGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.0.store(0, Ordering::Release);
    }
}
