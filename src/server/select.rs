//! Readiness backend over `select`.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;

use crate::event::EventSet;
use crate::server::ServerCore;
use crate::sys::posix::{self, FdSet};

pub(super) fn wait(core: &Arc<ServerCore>, timeout: Option<Duration>, process_io: bool) -> io::Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);

    core.wait_flag.store(true, Ordering::SeqCst);
    while core.wait_flag.load(Ordering::SeqCst) {
        // Snapshot the requested events of every dispatcher into the fd
        // sets consumed by select.
        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        let mut max_fd = -1;
        {
            let registry = core.registry.lock().unwrap();
            for entry in registry.entries() {
                if !process_io && entry.key != core.signaler_key {
                    continue;
                }
                let Some(dispatcher) = entry.disp.upgrade() else {
                    continue;
                };
                let fd = dispatcher.descriptor();
                if fd < 0 {
                    continue;
                }
                let requested = dispatcher.requested_events();
                if requested.intersects(EventSet::READ | EventSet::ACCEPT) {
                    read_set.set(fd);
                    max_fd = max_fd.max(fd);
                }
                if requested.intersects(EventSet::WRITE | EventSet::CONNECT) {
                    write_set.set(fd);
                    max_fd = max_fd.max(fd);
                }
            }
        }

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let ready = match posix::select(max_fd + 1, &mut read_set, &mut write_set, remaining) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                // A signal interrupted the wait. Any signal routed through
                // the loop has already poked its pipe, so the next pass
                // observes it naturally.
                continue;
            }
            Err(err) => {
                error!("select failed: {err}");
                return Err(err);
            }
        };

        if ready == 0 {
            // timeout
            return Ok(());
        }

        dispatch(core, &read_set, &write_set);

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Walks the registry, derives logical events for each ready descriptor
/// and invokes the dispatcher callbacks. The registry lock is only held
/// while stepping the cursor, never across a callback, so callbacks are
/// free to register and deregister dispatchers; cursor adjustment keeps
/// every remaining dispatcher visited exactly once. Dispatchers added
/// during the pass are bounded out by the end cursor and first polled on
/// the next cycle.
fn dispatch(core: &Arc<ServerCore>, read_set: &FdSet, write_set: &FdSet) {
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
        let fd = dispatcher.descriptor();
        if fd < 0 {
            continue;
        }

        let readable = read_set.contains(fd);
        let writable = write_set.contains(fd);
        if !readable && !writable {
            continue;
        }

        // Reap any pending asynchronous error; it decides between CONNECT
        // and CLOSE below and rides along with every delivery.
        let errcode = posix::so_error(fd).unwrap_or(0);

        let mut events = EventSet::NONE;
        if readable {
            if dispatcher.requested_events().contains(EventSet::ACCEPT) {
                events |= EventSet::ACCEPT;
            } else if errcode != 0 || dispatcher.is_descriptor_closed() {
                events |= EventSet::CLOSE;
            } else {
                events |= EventSet::READ;
            }
        }
        if writable {
            if dispatcher.requested_events().contains(EventSet::CONNECT) {
                if errcode == 0 {
                    events |= EventSet::CONNECT;
                } else {
                    events |= EventSet::CLOSE;
                }
            } else {
                events |= EventSet::WRITE;
            }
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
