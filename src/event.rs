use std::io;
use std::os::unix::io::RawFd;

/// Cross-thread signaling resource: a non-blocking self-pipe whose read
/// end registers with the reactor like any input stream.
///
/// `set` is async-signal-safe and may be called from any thread without
/// touching the reactor lock. The pipe is drained before the registered
/// callback runs, so the event auto-resets and coalesces rapid sets into
/// a single notification.
pub struct Event {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Event {
    pub fn new() -> io::Result<Event> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            if unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) } < 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok(Event {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Make the event signaled. A full pipe means a set is already
    /// pending, which is the state we wanted anyway.
    pub fn set(&self) -> io::Result<()> {
        let byte = [1u8];
        let n = unsafe { libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(()),
            _ => Err(err),
        }
    }

    /// Descriptor the reactor registers for input readiness.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Empty a signaled pipe so level-triggered waits go quiet again.
pub(crate) fn drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}
