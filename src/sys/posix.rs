use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

/// Wrapper over `fd_set` for use with `select`.
pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    pub fn new() -> FdSet {
        let mut raw = unsafe { mem::zeroed::<libc::fd_set>() };
        unsafe { libc::FD_ZERO(&mut raw) };
        FdSet { raw }
    }

    pub fn set(&mut self, fd: RawFd) {
        assert!((fd as usize) < libc::FD_SETSIZE, "descriptor {fd} exceeds FD_SETSIZE");
        unsafe { libc::FD_SET(fd, &mut self.raw) }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return false;
        }
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }
}

/// Blocks in `select` over the read and write sets. Returns the number of
/// ready descriptors, zero on timeout. `None` waits forever.
pub fn select(nfds: i32, read: &mut FdSet, write: &mut FdSet, timeout: Option<Duration>) -> io::Result<usize> {
    let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
    let tv_ptr = match timeout {
        Some(d) => {
            tv.tv_sec = d.as_secs() as libc::time_t;
            tv.tv_usec = d.subsec_micros() as libc::suseconds_t;
            &mut tv as *mut libc::timeval
        }
        None => ptr::null_mut(),
    };
    let n = unsafe { libc::select(nfds, &mut read.raw, &mut write.raw, ptr::null_mut(), tv_ptr) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Reaps any pending asynchronous error on the descriptor via `SO_ERROR`.
pub fn so_error(fd: RawFd) -> io::Result<i32> {
    getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR)
}

pub fn getsockopt_int(fd: RawFd, level: i32, opt: i32) -> io::Result<i32> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe { libc::getsockopt(fd, level, opt, &mut value as *mut _ as *mut libc::c_void, &mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

pub fn setsockopt_int(fd: RawFd, level: i32, opt: i32, value: i32) -> io::Result<()> {
    let len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe { libc::setsockopt(fd, level, opt, &value as *const _ as *const libc::c_void, len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A connected descriptor pair used to inject out-of-band wake-ups into a
/// readiness wait. Both ends are non-blocking so a drain never stalls the
/// loop and a burst of writers cannot block on a full pipe.
pub struct SelfPipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl SelfPipe {
    pub fn new() -> io::Result<SelfPipe> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let rx = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let tx = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking(rx.as_raw_fd())?;
        set_nonblocking(tx.as_raw_fd())?;
        Ok(SelfPipe { rx, tx })
    }

    pub fn read_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    pub fn write_byte(&self) -> io::Result<()> {
        let b = [0u8; 1];
        let n = unsafe { libc::write(self.tx.as_raw_fd(), b.as_ptr().cast(), 1) };
        if n != 1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reads and discards up to `max` pending bytes. Returns how many were
    /// drained; an empty pipe is not an error.
    pub fn drain(&self, max: usize) -> io::Result<usize> {
        let mut buf = [0u8; 16];
        let want = max.min(buf.len());
        let n = unsafe { libc::read(self.rx.as_raw_fd(), buf.as_mut_ptr().cast(), want) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_signal_and_drain_self_pipe() {
        let pipe = SelfPipe::new().expect("unable to create self pipe");
        assert_eq!(0, pipe.drain(16).expect("drain on empty pipe"));

        pipe.write_byte().expect("write");
        pipe.write_byte().expect("write");
        assert_eq!(2, pipe.drain(16).expect("drain"));
        assert_eq!(0, pipe.drain(16).expect("drain after empty"));
    }

    #[test]
    fn should_observe_readable_pipe_in_select() {
        let pipe = SelfPipe::new().expect("unable to create self pipe");
        pipe.write_byte().expect("write");

        let mut read = FdSet::new();
        let mut write = FdSet::new();
        read.set(pipe.read_fd());
        let n = select(pipe.read_fd() + 1, &mut read, &mut write, Some(Duration::from_millis(100)))
            .expect("select");
        assert_eq!(1, n);
        assert!(read.contains(pipe.read_fd()));
    }

    #[test]
    fn should_time_out_on_idle_pipe() {
        let pipe = SelfPipe::new().expect("unable to create self pipe");
        let mut read = FdSet::new();
        let mut write = FdSet::new();
        read.set(pipe.read_fd());
        let n = select(pipe.read_fd() + 1, &mut read, &mut write, Some(Duration::from_millis(10)))
            .expect("select");
        assert_eq!(0, n);
    }
}
