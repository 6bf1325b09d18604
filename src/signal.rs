//! Delivery of asynchronous POSIX signals into the wait loop.
//!
//! A real signal handler may only touch async-signal-safe state, so the
//! process-global router keeps a flag per signal number and a non-blocking
//! self-pipe: the handler sets the flag and writes one byte. A dispatcher
//! registered with the server drains the pipe and replays the flags into
//! user handlers on the loop thread.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, Once};

use log::{info, warn};

use crate::dispatcher::{Dispatcher, RawHandle};
use crate::event::EventSet;

/// POSIX names 32 signals but a system may define more; size the table
/// generously.
pub(crate) const NUM_SIGNALS: usize = 128;

static RECEIVED: [AtomicBool; NUM_SIGNALS] = [const { AtomicBool::new(false) }; NUM_SIGNALS];
static PIPE_READ: AtomicI32 = AtomicI32::new(-1);
static PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);
static PIPE_INIT: Once = Once::new();

/// Returns the read end of the router pipe, creating the pipe on first
/// use. The pipe lives for the rest of the process; signal handlers keep
/// referring to it through the write-end atomic.
pub(crate) fn router_fd() -> io::Result<RawFd> {
    PIPE_INIT.call_once(|| {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            warn!("unable to create signal pipe: {}", io::Error::last_os_error());
            return;
        }
        for fd in fds {
            if let Err(err) = crate::sys::posix::set_nonblocking(fd) {
                warn!("unable to make signal pipe non-blocking: {err}");
            }
        }
        PIPE_READ.store(fds[0], Ordering::SeqCst);
        PIPE_WRITE.store(fds[1], Ordering::SeqCst);
    });
    let fd = PIPE_READ.load(Ordering::SeqCst);
    if fd < 0 {
        return Err(io::Error::other("signal pipe unavailable"));
    }
    Ok(fd)
}

// Runs in signal context. Sets the flag, pokes the pipe, touches nothing
// else. The write may fail on a full pipe; the flag is already set and
// earlier bytes guarantee the loop will scan the table.
extern "C" fn deliver(signum: libc::c_int) {
    if (signum as usize) < NUM_SIGNALS {
        RECEIVED[signum as usize].store(true, Ordering::SeqCst);
    }
    let fd = PIPE_WRITE.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [0u8; 1];
        unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
    }
}

/// Installs a process signal disposition with `SA_RESTART` so interrupted
/// syscalls retry instead of surfacing `EINTR` everywhere.
fn install(signum: i32, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        if libc::sigemptyset(&mut act.sa_mask) != 0 {
            return Err(io::Error::last_os_error());
        }
        act.sa_sigaction = handler;
        act.sa_flags = libc::SA_RESTART;
        if libc::sigaction(signum, &act, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn install_router(signum: i32) -> io::Result<()> {
    install(signum, deliver as extern "C" fn(libc::c_int) as libc::sighandler_t)
}

pub(crate) fn restore_default(signum: i32) -> io::Result<()> {
    install(signum, libc::SIG_DFL)
}

/// Replays received signals into user handlers from the loop thread.
pub(crate) struct SignalDispatcher {
    fd: RawFd,
    handlers: Mutex<HashMap<i32, Box<dyn FnMut(i32) + Send>>>,
}

impl SignalDispatcher {
    pub fn new(fd: RawFd) -> SignalDispatcher {
        SignalDispatcher {
            fd,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_handler(&self, signum: i32, handler: Box<dyn FnMut(i32) + Send>) {
        self.handlers.lock().unwrap().insert(signum, handler);
    }

    pub fn clear_handler(&self, signum: i32) {
        self.handlers.lock().unwrap().remove(&signum);
    }

    pub fn has_handlers(&self) -> bool {
        !self.handlers.lock().unwrap().is_empty()
    }
}

impl Dispatcher for SignalDispatcher {
    fn requested_events(&self) -> EventSet {
        EventSet::READ
    }

    fn descriptor(&self) -> RawHandle {
        self.fd
    }

    fn on_pre_event(&self, _events: EventSet) {
        // signals arriving close together coalesce into few bytes; drain a
        // chunk per wake to keep the pipe from filling
        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            warn!("error draining signal pipe: {}", io::Error::last_os_error());
        } else if n == 0 {
            warn!("signal pipe woke up with nothing to read");
        }
    }

    fn on_event(&self, _events: EventSet, _error: i32) {
        let mut handlers = self.handlers.lock().unwrap();
        for signum in 0..NUM_SIGNALS {
            if RECEIVED[signum].swap(false, Ordering::SeqCst) {
                match handlers.get_mut(&(signum as i32)) {
                    Some(handler) => handler(signum as i32),
                    // possible when a signal lands while its handler is
                    // being removed; worth noting but not an error
                    None => info!("received signal with no handler: {signum}"),
                }
            }
        }
    }
}
