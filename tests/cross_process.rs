//! Cross-process attachment through the fault handler.
//!
//! The interesting path: a child forked before any segment exists inherits
//! the `PROT_NONE` reservation and the installed handler. When the parent
//! then allocates (creating segment 0 and mapping it in the parent only),
//! the child's first touch of the returned pointer faults, the handler
//! opens the current incarnation of the object, maps it over the slot and
//! resumes the read.
//!
//! Exactly one pool per process may own the fault-handler slot, so this
//! binary keeps everything in a single test function.

use dmapool::{DmaBufferPool, Error, PoolConfig};

/// Write the whole buffer, retrying on EINTR/short writes.
fn write_all(fd: i32, mut buf: &[u8]) {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            panic!("pipe write failed: {err}");
        }
        buf = &buf[n as usize..];
    }
}

/// Fill the whole buffer, retrying on EINTR/short reads.
fn read_exact(fd: i32, mut buf: &mut [u8]) {
    while !buf.is_empty() {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            panic!("pipe read failed: {err}");
        }
        if n == 0 {
            panic!("pipe closed early");
        }
        let consumed = n as usize;
        buf = &mut buf[consumed..];
    }
}

fn pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe: {}", std::io::Error::last_os_error());
    (fds[0], fds[1])
}

#[test]
fn test_forked_reader_attaches_on_fault() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let pool = DmaBufferPool::new(PoolConfig {
        segment_size: 1 << 28,
        max_segments: 2,
        persistent_segments: Some(2),
        install_fault_handler: true,
        ..PoolConfig::default()
    })
    .unwrap();

    // The fault-handler slot is exclusive per process.
    let conflict = DmaBufferPool::new(PoolConfig {
        segment_size: 1 << 28,
        max_segments: 2,
        install_fault_handler: true,
        ..PoolConfig::default()
    });
    assert!(matches!(conflict, Err(Error::HandlerInUse)));

    let (ptr_rx, ptr_tx) = pipe();
    let (result_rx, result_tx) = pipe();

    // Fork before the first allocation: the child must inherit only the
    // PROT_NONE reservation, never a mapping of segment 0.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork: {}", std::io::Error::last_os_error());

    if pid == 0 {
        // Child. Only raw syscalls and the faulting read below; the
        // handler does the attachment work.
        unsafe {
            libc::close(ptr_tx);
            libc::close(result_rx);

            let mut addr_bytes = [0u8; 8];
            read_exact(ptr_rx, &mut addr_bytes);
            let addr = usize::from_ne_bytes(addr_bytes) as *const u8;

            let mut payload = [0u8; 16];
            std::ptr::copy_nonoverlapping(addr, payload.as_mut_ptr(), payload.len());
            write_all(result_tx, &payload);
            libc::_exit(0);
        }
    }

    // Parent.
    unsafe {
        libc::close(ptr_rx);
        libc::close(result_tx);
    }

    let owner = pool.owner();
    let ptr = pool.alloc(&owner, 4096).unwrap();
    let message = *b"hello across fork";
    unsafe {
        std::ptr::copy_nonoverlapping(message.as_ptr(), ptr.as_ptr(), 16);
    }

    write_all(ptr_tx, &(ptr.as_ptr() as usize).to_ne_bytes());

    let mut echoed = [0u8; 16];
    read_exact(result_rx, &mut echoed);
    assert_eq!(&echoed[..], &message[..16], "child read different bytes");

    let mut status = 0i32;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(
        libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0,
        "child exited abnormally: status {status:#x}"
    );

    pool.free(ptr).unwrap();
    pool.audit().unwrap();

    // Dropping the pool releases the handler slot for the next pool.
    drop(pool);
    let next = DmaBufferPool::new(PoolConfig {
        segment_size: 1 << 28,
        max_segments: 2,
        install_fault_handler: true,
        ..PoolConfig::default()
    })
    .unwrap();
    drop(next);
}
