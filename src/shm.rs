//! POSIX shared-memory object naming and lifecycle.
//!
//! Object names follow `/.dmapool.<namespace>.<segment_id>:<incarnation>`,
//! where the incarnation is the segment revision divided by two (the parity
//! bit encodes liveness and is not part of the name). Names are formatted
//! into a fixed stack buffer with no heap involvement because the fault
//! handler has to build them in signal context.

use crate::error::Result;
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::shm::ShmOFlags;
use std::ffi::CStr;

const NAME_CAP: usize = 64;

/// A formatted, NUL-terminated shared-memory object name.
#[derive(Clone, Copy)]
pub(crate) struct ShmName {
    buf: [u8; NAME_CAP],
    len: usize,
}

impl ShmName {
    /// Name of a segment object for a given revision.
    pub(crate) fn segment(namespace: u32, segment_id: u32, revision: u32) -> Self {
        let mut name = Self::prefix(namespace);
        name.push_u32(segment_id);
        name.push_byte(b':');
        name.push_u32(revision >> 1);
        name.terminate();
        name
    }

    /// Name of the control-region object holding the segment table.
    pub(crate) fn control(namespace: u32) -> Self {
        let mut name = Self::prefix(namespace);
        name.push_bytes(b"ctl");
        name.terminate();
        name
    }

    fn prefix(namespace: u32) -> Self {
        let mut name = ShmName {
            buf: [0; NAME_CAP],
            len: 0,
        };
        name.push_bytes(b"/.dmapool.");
        name.push_u32(namespace);
        name.push_byte(b'.');
        name
    }

    fn push_byte(&mut self, b: u8) {
        self.buf[self.len] = b;
        self.len += 1;
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    fn push_u32(&mut self, mut v: u32) {
        let mut digits = [0u8; 10];
        let mut n = 0;
        loop {
            digits[n] = b'0' + (v % 10) as u8;
            n += 1;
            v /= 10;
            if v == 0 {
                break;
            }
        }
        while n > 0 {
            n -= 1;
            self.push_byte(digits[n]);
        }
    }

    fn terminate(&mut self) {
        self.buf[self.len] = 0;
    }

    pub(crate) fn as_cstr(&self) -> &CStr {
        // SAFETY: the buffer is NUL-terminated at `len` and contains no
        // interior NULs (only ASCII digits, dots and a colon).
        unsafe { CStr::from_bytes_with_nul_unchecked(&self.buf[..self.len + 1]) }
    }

    /// Raw pointer form for signal-context libc calls.
    pub(crate) fn as_ptr(&self) -> *const libc::c_char {
        self.buf.as_ptr().cast()
    }
}

impl std::fmt::Display for ShmName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.buf[..self.len]))
    }
}

impl std::fmt::Debug for ShmName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmName({})", self)
    }
}

/// Create (or truncate a stale incarnation of) an object and size it.
pub(crate) fn create_object(name: &ShmName, size: usize) -> Result<OwnedFd> {
    let fd = rustix::shm::shm_open(
        name.as_cstr(),
        ShmOFlags::CREATE | ShmOFlags::RDWR | ShmOFlags::TRUNC,
        Mode::RUSR | Mode::WUSR,
    )?;
    if let Err(e) = rustix::fs::ftruncate(&fd, size as u64) {
        let _ = rustix::shm::shm_unlink(name.as_cstr());
        return Err(e.into());
    }
    Ok(fd)
}

/// Open an existing object read-write.
pub(crate) fn open_object(name: &ShmName) -> Result<OwnedFd> {
    Ok(rustix::shm::shm_open(
        name.as_cstr(),
        ShmOFlags::RDWR,
        Mode::empty(),
    )?)
}

/// Truncate an object to zero so ghost mappings in peer processes lose
/// their backing, then unlink the name.
pub(crate) fn truncate_and_unlink(name: &ShmName) -> Result<()> {
    let fd = rustix::shm::shm_open(name.as_cstr(), ShmOFlags::RDWR | ShmOFlags::TRUNC, Mode::empty())?;
    drop(fd);
    rustix::shm::shm_unlink(name.as_cstr())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name_format() {
        let name = ShmName::segment(7, 3, 5);
        // Revision 5 is incarnation 2.
        assert_eq!(name.as_cstr().to_str().unwrap(), "/.dmapool.7.3:2");
    }

    #[test]
    fn test_control_name_format() {
        let name = ShmName::control(4_294_967_295);
        assert_eq!(name.as_cstr().to_str().unwrap(), "/.dmapool.4294967295.ctl");
    }

    #[test]
    fn test_object_round_trip() {
        let name = ShmName::segment(std::process::id(), 999, 1);
        let fd = create_object(&name, 4096).unwrap();
        drop(fd);
        let fd = open_object(&name).unwrap();
        drop(fd);
        truncate_and_unlink(&name).unwrap();
        assert!(open_object(&name).is_err());
    }
}
