//! Readiness backend over WinSock event objects. Every socket is armed
//! onto one shared manual-reset event with `WSAEventSelect`; dispatchers
//! backed by their own event object join the wait array as extra entries.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, warn};

use windows_sys::Win32::Networking::WinSock::{
    WSAWaitForMultipleEvents, FD_ACCEPT, FD_CLOSE, FD_CLOSE_BIT, FD_CONNECT, FD_CONNECT_BIT, FD_READ, FD_WRITE,
    SOCKET, WSA_INFINITE, WSA_WAIT_EVENT_0, WSA_WAIT_FAILED, WSA_WAIT_TIMEOUT,
};

use crate::dispatcher::{Dispatcher, INVALID_HANDLE};
use crate::event::EventSet;
use crate::server::ServerCore;
use crate::sys::windows::{self, RawWsaEvent, INVALID_WSA_EVENT};

fn to_network_events(requested: EventSet) -> i32 {
    // always watch for close so peer shutdown is never missed
    let mut mask = FD_CLOSE;
    if requested.contains(EventSet::READ) {
        mask |= FD_READ;
    }
    if requested.contains(EventSet::WRITE) {
        mask |= FD_WRITE;
    }
    if requested.contains(EventSet::CONNECT) {
        mask |= FD_CONNECT;
    }
    if requested.contains(EventSet::ACCEPT) {
        mask |= FD_ACCEPT;
    }
    mask as i32
}

pub(super) fn wait(core: &Arc<ServerCore>, timeout: Option<Duration>, process_io: bool) -> io::Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);

    core.wait_flag.store(true, Ordering::SeqCst);
    while core.wait_flag.load(Ordering::SeqCst) {
        let mut events: Vec<RawWsaEvent> = vec![core.socket_event.raw()];
        let mut event_owners: Vec<Arc<dyn Dispatcher>> = Vec::new();

        // Arm every dispatcher onto the shared event. The cursor walk
        // deliberately re-reads the registry length so dispatchers added
        // while arming are picked up too.
        let position = core.registry.lock().unwrap().push_cursor(0);
        loop {
            let entry = {
                let mut registry = core.registry.lock().unwrap();
                let index = registry.cursor(position);
                if index >= registry.len() {
                    break;
                }
                registry.set_cursor(position, index + 1);
                registry.entry(index)
            };
            let Some(entry) = entry else {
                continue;
            };
            if !process_io && entry.key != core.signaler_key {
                continue;
            }
            let Some(dispatcher) = entry.disp.upgrade() else {
                continue;
            };
            let socket = dispatcher.descriptor();
            if dispatcher.check_signal_close() {
                // just emitted the deferred close, leave the socket alone
            } else if socket != INVALID_HANDLE {
                if let Err(err) =
                    windows::event_select(socket as SOCKET, events[0], to_network_events(dispatcher.requested_events()))
                {
                    warn!("WSAEventSelect failed: {err}");
                }
            } else {
                let event = dispatcher.wsa_event();
                if event != INVALID_WSA_EVENT {
                    events.push(event);
                    event_owners.push(dispatcher);
                }
            }
        }
        core.registry.lock().unwrap().pop_cursor(position);

        let wait_ms = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .as_millis()
                .min(u128::from(WSA_INFINITE - 1)) as u32,
            None => WSA_INFINITE,
        };

        let dw = unsafe { WSAWaitForMultipleEvents(events.len() as u32, events.as_ptr(), 0, wait_ms, 0) };
        if dw == WSA_WAIT_FAILED {
            let err = windows::last_wsa_error();
            error!("WSAWaitForMultipleEvents failed: {err}");
            return Err(err);
        }
        if dw == WSA_WAIT_TIMEOUT {
            return Ok(());
        }

        let index = (dw - WSA_WAIT_EVENT_0) as usize;
        if index > 0 {
            // an auxiliary event object fired
            let owner = &event_owners[index - 1];
            owner.on_pre_event(EventSet::NONE);
            owner.on_event(EventSet::NONE, 0);
        } else if process_io {
            dispatch(core);
        }
        core.socket_event.reset();

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Fans the shared event back out: harvests each socket's recorded network
/// events and delivers the logical translation. Bounded by an end cursor so
/// sockets registered by a callback wait until the next cycle.
fn dispatch(core: &Arc<ServerCore>) {
    let shared_event = core.socket_event.raw();
    let (position, end) = {
        let mut registry = core.registry.lock().unwrap();
        let len = registry.len();
        (registry.push_cursor(0), registry.push_cursor(len))
    };

    loop {
        let entry = {
            let mut registry = core.registry.lock().unwrap();
            let index = registry.cursor(position);
            if index >= registry.cursor(end) {
                break;
            }
            registry.set_cursor(position, index + 1);
            registry.entry(index)
        };
        let Some(entry) = entry else {
            continue;
        };
        let Some(dispatcher) = entry.disp.upgrade() else {
            continue;
        };
        let socket = dispatcher.descriptor();
        if socket == INVALID_HANDLE {
            continue;
        }

        let network_events = match windows::enum_network_events(socket as SOCKET, shared_event) {
            Ok(ev) => ev,
            Err(err) => {
                warn!("WSAEnumNetworkEvents failed: {err}");
                continue;
            }
        };

        let recorded = network_events.lNetworkEvents as u32;
        let mut events = EventSet::NONE;
        let mut errcode = 0;
        if recorded & FD_READ != 0 {
            events |= EventSet::READ;
        }
        if recorded & FD_WRITE != 0 {
            events |= EventSet::WRITE;
        }
        if recorded & FD_CONNECT != 0 {
            let connect_err = network_events.iErrorCode[FD_CONNECT_BIT as usize];
            if connect_err == 0 {
                events |= EventSet::CONNECT;
            } else {
                events |= EventSet::CLOSE;
                errcode = connect_err;
            }
        }
        if recorded & FD_ACCEPT != 0 {
            events |= EventSet::ACCEPT;
        }
        if recorded & FD_CLOSE != 0 {
            events |= EventSet::CLOSE;
            errcode = network_events.iErrorCode[FD_CLOSE_BIT as usize];
        }

        if !events.is_empty() {
            dispatcher.on_pre_event(events);
            dispatcher.on_event(events, errcode);
        }
    }

    let mut registry = core.registry.lock().unwrap();
    registry.pop_cursor(end);
    registry.pop_cursor(position);
}
