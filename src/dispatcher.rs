//! Capability contract implemented by every event source registered with
//! the server.

use crate::event::EventSet;

/// OS handle watched by the readiness backend.
#[cfg(unix)]
pub type RawHandle = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawHandle = std::os::windows::io::RawSocket;

/// Sentinel for "no pollable handle". Event object backed dispatchers
/// return this from [`Dispatcher::descriptor`].
#[cfg(unix)]
pub const INVALID_HANDLE: RawHandle = -1;
#[cfg(windows)]
pub const INVALID_HANDLE: RawHandle = RawHandle::MAX;

/// An event source owned outside the loop. The registry holds it by weak
/// reference only; dropping the source deregisters it.
///
/// `on_pre_event` runs before any user visible callback and must not call
/// back into the server. `on_event` may mutate the registry, including
/// removing the current dispatcher.
pub trait Dispatcher: Send + Sync {
    /// Events the loop should watch for in the next wait cycle.
    fn requested_events(&self) -> EventSet;

    /// Handle to poll, or [`INVALID_HANDLE`] for event object dispatchers.
    fn descriptor(&self) -> RawHandle {
        INVALID_HANDLE
    }

    /// Consulted on readability to distinguish data from end-of-stream.
    /// Implementations may peek one byte non-destructively.
    fn is_descriptor_closed(&self) -> bool {
        false
    }

    /// Invariant updates that must precede signal emission.
    fn on_pre_event(&self, events: EventSet);

    /// Emit application level signals. `error` is the OS error code reaped
    /// for this descriptor, zero when none.
    fn on_event(&self, events: EventSet, error: i32);

    /// Native event object for dispatchers without a socket handle.
    #[cfg(windows)]
    fn wsa_event(&self) -> crate::sys::windows::RawWsaEvent {
        crate::sys::windows::INVALID_WSA_EVENT
    }

    /// Gives the dispatcher a chance to emit a deferred close before the
    /// next wait. Returns `true` if the close fired and the handle should
    /// not be polled this cycle.
    #[cfg(windows)]
    fn check_signal_close(&self) -> bool {
        false
    }
}
