//! Thin wrappers over the native readiness primitives and OS plumbing.

#[cfg(unix)]
pub mod posix;
#[cfg(windows)]
pub mod windows;

use std::io;

/// Raw OS error code recorded on a socket after an operation. Synthetic
/// errors without an OS code collapse to the platform would-block or
/// generic I/O code so `error()` stays meaningful.
pub fn os_error_code(err: &io::Error) -> i32 {
    if let Some(code) = err.raw_os_error() {
        return code;
    }
    match err.kind() {
        #[cfg(unix)]
        io::ErrorKind::WouldBlock => libc::EWOULDBLOCK,
        #[cfg(windows)]
        io::ErrorKind::WouldBlock => windows_sys::Win32::Networking::WinSock::WSAEWOULDBLOCK,
        #[cfg(unix)]
        _ => libc::EIO,
        #[cfg(windows)]
        _ => windows_sys::Win32::Networking::WinSock::WSAEFAULT,
    }
}

/// Back-pressure and async-connect-in-flight codes are not failures.
pub fn is_blocking_error(code: i32) -> bool {
    #[cfg(unix)]
    {
        code == libc::EWOULDBLOCK || code == libc::EAGAIN || code == libc::EINPROGRESS
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::Networking::WinSock::{WSAEINPROGRESS, WSAEWOULDBLOCK};
        code == WSAEWOULDBLOCK || code == WSAEINPROGRESS
    }
}
