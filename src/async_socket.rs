//! Socket dispatcher: ties a non-blocking socket's enabled-events mask
//! into the event loop and turns readiness into handler callbacks.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;
use socket2::Socket as OsSocket;

use crate::dispatcher::{Dispatcher, RawHandle};
use crate::event::EventSet;
use crate::relay::ResolveCompletion;
use crate::server::ServerCore;
use crate::socket::{already_code, ConnState, SocketCore, SocketOption, SocketType};

/// Application callbacks fired by the loop. All methods default to no-ops
/// so a handler implements only the signals it cares about.
///
/// Each delivered event bit is cleared from the socket's enabled set
/// before its callback runs; requesting more I/O from inside the callback
/// (for example by calling [`AsyncSocket::recv`]) re-arms it for the next
/// wait cycle.
pub trait SocketHandler: Send {
    fn on_readable(&mut self, _socket: &AsyncSocket) {}
    fn on_writable(&mut self, _socket: &AsyncSocket) {}
    fn on_connected(&mut self, _socket: &AsyncSocket) {}
    fn on_closed(&mut self, _socket: &AsyncSocket, _error: i32) {}
}

#[cfg(windows)]
#[derive(Default)]
struct CloseSignal {
    armed: bool,
    error: i32,
}

/// Asynchronous socket registered with a [`crate::server::SocketServer`].
///
/// Created through the server factories; the handle is made non-blocking
/// at registration time. Once a handler is installed, readiness arrives as
/// `on_readable` / `on_writable` / `on_connected` / `on_closed` calls on
/// the loop thread.
pub struct AsyncSocket {
    server: Arc<ServerCore>,
    key: u64,
    self_ref: Weak<AsyncSocket>,
    core: Mutex<SocketCore>,
    handler: Mutex<Option<Box<dyn SocketHandler>>>,
    // Batch token guarding multi-signal delivery: zeroed on close so a
    // handler that closes the socket suppresses the rest of the batch.
    id: AtomicU64,
    registered: AtomicBool,
    #[cfg(windows)]
    close_signal: Mutex<CloseSignal>,
}

impl AsyncSocket {
    pub(crate) fn create(server: &Arc<ServerCore>, ty: SocketType) -> io::Result<Arc<AsyncSocket>> {
        let socket = Self::empty(server);
        socket.open(ty)?;
        Ok(socket)
    }

    pub(crate) fn adopt(server: &Arc<ServerCore>, os_socket: OsSocket) -> io::Result<Arc<AsyncSocket>> {
        let socket = Self::empty(server);
        *socket.core.lock().unwrap() = SocketCore::from_os_socket(os_socket)?;
        socket.initialize()?;
        Ok(socket)
    }

    fn empty(server: &Arc<ServerCore>) -> Arc<AsyncSocket> {
        Arc::new_cyclic(|self_ref| AsyncSocket {
            server: server.clone(),
            key: server.alloc_key(),
            self_ref: self_ref.clone(),
            core: Mutex::new(SocketCore::new()),
            handler: Mutex::new(None),
            id: AtomicU64::new(0),
            registered: AtomicBool::new(false),
            #[cfg(windows)]
            close_signal: Mutex::new(CloseSignal::default()),
        })
    }

    /// Creates (or re-creates after close) the underlying OS socket and
    /// registers the dispatcher with the server.
    pub fn open(&self, ty: SocketType) -> io::Result<()> {
        self.core.lock().unwrap().open(ty)?;
        self.initialize()
    }

    fn initialize(&self) -> io::Result<()> {
        self.core.lock().unwrap().set_nonblocking()?;
        self.id.store(self.server.alloc_id(), Ordering::SeqCst);
        self.server
            .add_dispatcher_keyed(self.key, self.self_ref.clone() as Weak<dyn Dispatcher>);
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Installs the handler receiving this socket's signals, replacing any
    /// previous one.
    pub fn set_handler(&self, handler: impl SocketHandler + 'static) {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.core.lock().unwrap().bind(addr)
    }

    /// Starts a non-blocking connect to a resolved address. Completion is
    /// delivered as `on_connected` (or `on_closed` with the error reaped
    /// from the descriptor).
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        self.ensure_open()?;
        self.core.lock().unwrap().do_connect(addr)
    }

    /// Connects to `host:port`. IP literals connect directly; hostnames
    /// are resolved in the background while the socket reports
    /// `Connecting`. Resolution failure closes the socket and fires
    /// `on_closed` with the resolution error on a later wait cycle.
    pub fn connect_to(&self, host: &str, port: u16) -> io::Result<()> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.connect(SocketAddr::new(ip, port));
        }
        self.ensure_open()?;
        let seq = self.server.alloc_resolve_seq();
        {
            let mut core = self.core.lock().unwrap();
            if core.state() != ConnState::Closed {
                core.set_error(already_code());
                return Err(io::Error::from_raw_os_error(already_code()));
            }
            core.begin_resolve(seq);
        }
        debug!("resolving {host} before connect");
        let relay = self.server.resolve_relay();
        let socket = self.self_ref.clone();
        let lookup = self.server.dns().and_then(|dns| {
            dns.lookup(host, port, move |result| {
                relay.complete(ResolveCompletion {
                    socket,
                    seq,
                    result: result.map_err(|err| err.os_code()),
                });
            })
        });
        let mut core = self.core.lock().unwrap();
        match lookup {
            Ok(lookup) => {
                core.attach_resolver(seq, lookup);
                Ok(())
            }
            Err(err) => {
                // could not even start the lookup; undo the connect attempt
                core.take_resolver(seq);
                core.set_state(ConnState::Closed);
                core.set_error(crate::sys::os_error_code(&err));
                Err(err)
            }
        }
    }

    /// Applies one resolver outcome, ignoring stale attempts.
    pub(crate) fn handle_resolve(&self, seq: u64, result: Result<SocketAddr, i32>) {
        if self.core.lock().unwrap().take_resolver(seq).is_none() {
            // closed or superseded while the lookup was in flight
            return;
        }
        let error = match result {
            Ok(addr) => match self.core.lock().unwrap().do_connect(addr) {
                Ok(()) => return,
                Err(err) => crate::sys::os_error_code(&err),
            },
            Err(code) => {
                let _ = self.close();
                self.core.lock().unwrap().set_error(code);
                code
            }
        };
        self.emit_closed(error);
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.core.lock().unwrap().listen(backlog)
    }

    /// Accepts one pending connection as a freshly registered dispatcher
    /// socket and re-arms `ACCEPT`.
    pub fn accept(&self) -> io::Result<(Arc<AsyncSocket>, SocketAddr)> {
        let (os_socket, peer) = self.core.lock().unwrap().accept_os_socket()?;
        let socket = AsyncSocket::adopt(&self.server, os_socket)?;
        Ok((socket, peer))
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.core.lock().unwrap().send(buf)
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.core.lock().unwrap().send_to(buf, addr)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.core.lock().unwrap().recv(buf)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.core.lock().unwrap().recv_from(buf)
    }

    pub fn get_option(&self, opt: SocketOption) -> io::Result<i32> {
        self.core.lock().unwrap().get_option(opt)
    }

    pub fn set_option(&self, opt: SocketOption, value: i32) -> io::Result<()> {
        self.core.lock().unwrap().set_option(opt, value)
    }

    pub fn estimate_mtu(&self) -> io::Result<u16> {
        self.core.lock().unwrap().estimate_mtu()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.lock().unwrap().local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.core.lock().unwrap().peer_addr()
    }

    pub fn state(&self) -> ConnState {
        self.core.lock().unwrap().state()
    }

    pub fn last_error(&self) -> i32 {
        self.core.lock().unwrap().last_error()
    }

    /// Closes the socket and deregisters it. Idempotent; any pending
    /// hostname resolution is torn down without ever reaching the handler.
    pub fn close(&self) -> io::Result<()> {
        {
            let mut core = self.core.lock().unwrap();
            if core.is_open() {
                self.id.store(0, Ordering::SeqCst);
                #[cfg(windows)]
                {
                    *self.close_signal.lock().unwrap() = CloseSignal::default();
                }
                core.close();
            }
        }
        if self.registered.swap(false, Ordering::SeqCst) {
            self.server.remove_dispatcher_keyed(self.key);
        }
        Ok(())
    }

    fn ensure_open(&self) -> io::Result<()> {
        if !self.core.lock().unwrap().is_open() {
            self.open(SocketType::Stream)?;
        }
        Ok(())
    }

    fn consume_enabled(&self, events: EventSet) {
        self.core.lock().unwrap().disable(events);
    }

    fn emit_closed(&self, error: i32) {
        let handler = self.handler.lock().unwrap().take();
        if let Some(mut handler) = handler {
            handler.on_closed(self, error);
            let mut slot = self.handler.lock().unwrap();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }
}

impl Dispatcher for AsyncSocket {
    fn requested_events(&self) -> EventSet {
        self.core.lock().unwrap().enabled()
    }

    fn descriptor(&self) -> RawHandle {
        self.core.lock().unwrap().handle()
    }

    fn is_descriptor_closed(&self) -> bool {
        self.core.lock().unwrap().peek_closed()
    }

    fn on_pre_event(&self, events: EventSet) {
        let mut core = self.core.lock().unwrap();
        if events.contains(EventSet::CONNECT) {
            core.set_state(ConnState::Connected);
        }
        #[cfg(unix)]
        if events.contains(EventSet::CLOSE) {
            core.set_state(ConnState::Closed);
        }
        // On Windows the close is confirmed (and the state updated) by
        // check_signal_close once the receive buffer has drained.
    }

    fn on_event(&self, events: EventSet, error: i32) {
        let token = self.id.load(Ordering::SeqCst);
        let mut handler = self.handler.lock().unwrap().take();

        let read_bits = events & (EventSet::READ | EventSet::ACCEPT);
        if !read_bits.is_empty() {
            self.consume_enabled(read_bits);
            if let Some(h) = handler.as_mut() {
                h.on_readable(self);
            }
        }
        if events.contains(EventSet::WRITE) && self.id.load(Ordering::SeqCst) == token {
            self.consume_enabled(EventSet::WRITE);
            if let Some(h) = handler.as_mut() {
                h.on_writable(self);
            }
        }
        if events.contains(EventSet::CONNECT) && self.id.load(Ordering::SeqCst) == token {
            self.consume_enabled(EventSet::CONNECT);
            if let Some(h) = handler.as_mut() {
                h.on_connected(self);
            }
        }
        if events.contains(EventSet::CLOSE) && self.id.load(Ordering::SeqCst) == token {
            #[cfg(unix)]
            {
                // the socket is dead to the loop, stop watching it
                self.core.lock().unwrap().clear_enabled();
                if let Some(h) = handler.as_mut() {
                    h.on_closed(self, error);
                }
            }
            #[cfg(windows)]
            {
                let mut close_signal = self.close_signal.lock().unwrap();
                close_signal.armed = true;
                close_signal.error = error;
            }
        }

        if let Some(handler) = handler {
            let mut slot = self.handler.lock().unwrap();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    #[cfg(windows)]
    fn check_signal_close(&self) -> bool {
        let error = {
            let mut close_signal = self.close_signal.lock().unwrap();
            if !close_signal.armed {
                return false;
            }
            // data may still be buffered; keep delivering READ until the
            // stream is truly drained
            if !self.core.lock().unwrap().peek_closed() {
                return false;
            }
            close_signal.armed = false;
            close_signal.error
        };
        {
            let mut core = self.core.lock().unwrap();
            core.set_state(ConnState::Closed);
            core.clear_enabled();
        }
        self.emit_closed(error);
        true
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
