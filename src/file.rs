//! Read/write dispatcher over an arbitrary file descriptor.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::dispatcher::{Dispatcher, RawHandle};
use crate::event::EventSet;
use crate::server::ServerCore;
use crate::sys::posix;

use std::io;

/// Callbacks fired for a wrapped descriptor. Defaults are no-ops.
pub trait FileHandler: Send {
    fn on_readable(&mut self, _file: &FileDispatcher) {}
    fn on_writable(&mut self, _file: &FileDispatcher) {}
    fn on_closed(&mut self, _file: &FileDispatcher, _error: i32) {}
}

/// Wraps a caller-owned descriptor (a tty, a fifo, an inotify fd) as an
/// event source. The descriptor is made non-blocking on wrap but its
/// ownership stays with the caller; dropping the dispatcher only
/// deregisters it.
pub struct FileDispatcher {
    server: Arc<ServerCore>,
    key: u64,
    fd: RawFd,
    flags: Mutex<EventSet>,
    handler: Mutex<Option<Box<dyn FileHandler>>>,
}

impl FileDispatcher {
    pub(crate) fn wrap(server: &Arc<ServerCore>, fd: RawFd) -> io::Result<Arc<FileDispatcher>> {
        posix::set_nonblocking(fd)?;
        let file = Arc::new(FileDispatcher {
            server: server.clone(),
            key: server.alloc_key(),
            fd,
            flags: Mutex::new(EventSet::READ),
            handler: Mutex::new(None),
        });
        server.add_dispatcher_keyed(file.key, Arc::downgrade(&file) as Weak<dyn Dispatcher>);
        Ok(file)
    }

    pub fn set_handler(&self, handler: impl FileHandler + 'static) {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn readable(&self) -> bool {
        self.flags.lock().unwrap().contains(EventSet::READ)
    }

    pub fn set_readable(&self, value: bool) {
        let mut flags = self.flags.lock().unwrap();
        if value {
            *flags |= EventSet::READ;
        } else {
            *flags -= EventSet::READ;
        }
    }

    pub fn writable(&self) -> bool {
        self.flags.lock().unwrap().contains(EventSet::WRITE)
    }

    pub fn set_writable(&self, value: bool) {
        let mut flags = self.flags.lock().unwrap();
        if value {
            *flags |= EventSet::WRITE;
        } else {
            *flags -= EventSet::WRITE;
        }
    }
}

impl Dispatcher for FileDispatcher {
    fn requested_events(&self) -> EventSet {
        *self.flags.lock().unwrap()
    }

    fn descriptor(&self) -> RawHandle {
        self.fd
    }

    fn on_pre_event(&self, _events: EventSet) {}

    fn on_event(&self, events: EventSet, error: i32) {
        let handler = self.handler.lock().unwrap().take();
        if let Some(mut handler) = handler {
            if events.contains(EventSet::READ) {
                handler.on_readable(self);
            }
            if events.contains(EventSet::WRITE) {
                handler.on_writable(self);
            }
            if events.contains(EventSet::CLOSE) {
                handler.on_closed(self, error);
            }
            let mut slot = self.handler.lock().unwrap();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }
}

impl Drop for FileDispatcher {
    fn drop(&mut self) {
        self.server.remove_dispatcher_keyed(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::SocketServer;
    use std::time::Duration;

    struct Drainer {
        reads: Arc<Mutex<usize>>,
    }

    impl FileHandler for Drainer {
        fn on_readable(&mut self, file: &FileDispatcher) {
            let mut buf = [0u8; 16];
            unsafe { libc::read(file.raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            *self.reads.lock().unwrap() += 1;
        }
    }

    #[test]
    fn should_dispatch_readable_descriptor() {
        let server = SocketServer::new().expect("unable to create server");
        let pipe = posix::SelfPipe::new().expect("unable to create pipe");
        let file = server.create_file(pipe.read_fd()).expect("unable to wrap fd");

        let reads = Arc::new(Mutex::new(0));
        file.set_handler(Drainer { reads: reads.clone() });

        pipe.write_byte().expect("write failed");
        for _ in 0..20 {
            if *reads.lock().unwrap() > 0 {
                break;
            }
            server.wait(Some(Duration::from_millis(50)), true).expect("wait failed");
        }
        assert!(*reads.lock().unwrap() > 0);
    }

    #[test]
    fn should_toggle_requested_events() {
        let server = SocketServer::new().expect("unable to create server");
        let pipe = posix::SelfPipe::new().expect("unable to create pipe");
        let file = server.create_file(pipe.read_fd()).expect("unable to wrap fd");

        assert!(file.readable());
        assert!(!file.writable());

        file.set_writable(true);
        file.set_readable(false);
        assert_eq!(EventSet::WRITE, file.requested_events());
    }
}
