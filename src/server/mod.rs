//! The event loop: dispatcher registry, readiness wait and factories.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::async_socket::AsyncSocket;
use crate::dispatcher::Dispatcher;
use crate::dns::DnsService;
use crate::relay::{ResolveRelay, Signaler};
use crate::socket::{Socket, SocketType};

#[cfg(unix)]
use crate::file::FileDispatcher;
#[cfg(unix)]
use crate::signal::{self, SignalDispatcher};
#[cfg(unix)]
use std::os::fd::RawFd;

#[cfg(unix)]
mod select;
#[cfg(windows)]
mod wsa;

#[derive(Clone)]
pub(crate) struct Entry {
    pub key: u64,
    pub disp: Weak<dyn Dispatcher>,
}

struct Cursor {
    token: u64,
    index: usize,
}

/// Ordered set of registered dispatchers plus the live iteration cursors
/// of any in-flight dispatch pass. Removal keeps every cursor pointing at
/// the next unvisited entry, so a callback may deregister any dispatcher
/// (itself included) without an entry being skipped or visited twice.
pub(crate) struct Registry {
    entries: Vec<Entry>,
    cursors: Vec<Cursor>,
    next_cursor: u64,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            entries: Vec::new(),
            cursors: Vec::new(),
            next_cursor: 0,
        }
    }

    /// Idempotent: re-adding a registered key is ignored. Duplicates would
    /// let dead dispatchers stick around.
    fn add(&mut self, key: u64, disp: Weak<dyn Dispatcher>) {
        if self.entries.iter().any(|e| e.key == key) {
            return;
        }
        self.entries.push(Entry { key, disp });
    }

    fn remove(&mut self, key: u64) {
        let Some(index) = self.entries.iter().position(|e| e.key == key) else {
            debug_assert!(false, "removing a dispatcher that is not registered");
            return;
        };
        self.entries.remove(index);
        for cursor in &mut self.cursors {
            if index < cursor.index {
                cursor.index -= 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> Option<Entry> {
        self.entries.get(index).cloned()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn push_cursor(&mut self, index: usize) -> u64 {
        let token = self.next_cursor;
        self.next_cursor += 1;
        self.cursors.push(Cursor { token, index });
        token
    }

    pub fn cursor(&self, token: u64) -> usize {
        self.cursors
            .iter()
            .find(|c| c.token == token)
            .map(|c| c.index)
            .expect("unknown cursor")
    }

    pub fn set_cursor(&mut self, token: u64, index: usize) {
        let cursor = self
            .cursors
            .iter_mut()
            .find(|c| c.token == token)
            .expect("unknown cursor");
        cursor.index = index;
    }

    pub fn pop_cursor(&mut self, token: u64) {
        debug_assert_eq!(Some(token), self.cursors.last().map(|c| c.token));
        self.cursors.retain(|c| c.token != token);
    }
}

/// Shared state behind a [`SocketServer`] handle. Dispatcher sockets hold
/// it alive for as long as they exist.
pub(crate) struct ServerCore {
    pub(crate) registry: Mutex<Registry>,
    pub(crate) wait_flag: Arc<AtomicBool>,
    signaler: Arc<Signaler>,
    pub(crate) signaler_key: u64,
    resolve_relay: Arc<ResolveRelay>,
    dns: Mutex<Option<DnsService>>,
    next_key: AtomicU64,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    #[cfg(unix)]
    signals: Mutex<Option<(u64, Arc<SignalDispatcher>)>>,
    #[cfg(windows)]
    pub(crate) socket_event: crate::sys::windows::WsaEvent,
}

const SIGNALER_KEY: u64 = 1;
const RESOLVE_RELAY_KEY: u64 = 2;
const FIRST_DISPATCHER_KEY: u64 = 3;

impl ServerCore {
    fn new() -> io::Result<Arc<ServerCore>> {
        let wait_flag = Arc::new(AtomicBool::new(false));
        let signaler = Arc::new(Signaler::new(wait_flag.clone())?);
        let resolve_relay = Arc::new(ResolveRelay::new()?);
        let core = Arc::new(ServerCore {
            registry: Mutex::new(Registry::new()),
            wait_flag,
            signaler: signaler.clone(),
            signaler_key: SIGNALER_KEY,
            resolve_relay: resolve_relay.clone(),
            dns: Mutex::new(None),
            next_key: AtomicU64::new(FIRST_DISPATCHER_KEY),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            #[cfg(unix)]
            signals: Mutex::new(None),
            #[cfg(windows)]
            socket_event: crate::sys::windows::WsaEvent::new()?,
        });
        core.add_dispatcher_keyed(SIGNALER_KEY, Arc::downgrade(&signaler) as Weak<dyn Dispatcher>);
        core.add_dispatcher_keyed(RESOLVE_RELAY_KEY, Arc::downgrade(&resolve_relay) as Weak<dyn Dispatcher>);
        Ok(core)
    }

    pub(crate) fn alloc_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::SeqCst)
    }

    /// Batch tokens are never zero; zero marks a closed socket.
    pub(crate) fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn alloc_resolve_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn add_dispatcher_keyed(&self, key: u64, disp: Weak<dyn Dispatcher>) {
        self.registry.lock().unwrap().add(key, disp);
    }

    pub(crate) fn remove_dispatcher_keyed(&self, key: u64) {
        self.registry.lock().unwrap().remove(key);
    }

    pub(crate) fn resolve_relay(&self) -> Arc<ResolveRelay> {
        self.resolve_relay.clone()
    }

    /// The resolver worker is started lazily on the first hostname connect.
    pub(crate) fn dns(&self) -> io::Result<DnsService> {
        let mut slot = self.dns.lock().unwrap();
        if slot.is_none() {
            *slot = Some(DnsService::start()?);
        }
        Ok(slot.as_ref().expect("resolver just started").clone())
    }

    pub(crate) fn wake_up(&self) {
        self.signaler.signal();
    }
}

/// The socket server: owns the wait loop and the dispatcher registry.
///
/// Cloning is cheap and every clone drives the same loop. All operations
/// are safe from any thread, with the convention that a single thread
/// calls [`SocketServer::wait`] at a time; dispatcher callbacks run
/// synchronously on that thread.
#[derive(Clone)]
pub struct SocketServer {
    core: Arc<ServerCore>,
}

impl SocketServer {
    pub fn new() -> io::Result<SocketServer> {
        Ok(SocketServer { core: ServerCore::new()? })
    }

    /// Creates a raw socket without event loop integration.
    pub fn create_socket(&self, ty: SocketType) -> io::Result<Socket> {
        Socket::open(ty)
    }

    /// Creates a non-blocking socket registered with the loop.
    pub fn create_async_socket(&self, ty: SocketType) -> io::Result<Arc<AsyncSocket>> {
        AsyncSocket::create(&self.core, ty)
    }

    /// Adopts an existing OS socket (for example one accepted elsewhere)
    /// as a registered dispatcher socket.
    pub fn wrap_socket(&self, os_socket: socket2::Socket) -> io::Result<Arc<AsyncSocket>> {
        AsyncSocket::adopt(&self.core, os_socket)
    }

    /// Wraps a caller-owned descriptor as a read/write dispatcher.
    #[cfg(unix)]
    pub fn create_file(&self, fd: RawFd) -> io::Result<Arc<FileDispatcher>> {
        FileDispatcher::wrap(&self.core, fd)
    }

    /// Registers a custom dispatcher and returns the key to deregister it
    /// with. Registering the same key twice is a no-op.
    pub fn add_dispatcher(&self, disp: Weak<dyn Dispatcher>) -> u64 {
        let key = self.core.alloc_key();
        self.core.add_dispatcher_keyed(key, disp);
        key
    }

    /// Deregisters a dispatcher. Removing a key that is not registered is
    /// a programming error and trips a debug assertion.
    pub fn remove_dispatcher(&self, key: u64) {
        self.core.remove_dispatcher_keyed(key);
    }

    /// Makes a concurrent [`SocketServer::wait`] return promptly. Safe
    /// from any thread, including before the wait starts.
    pub fn wake_up(&self) {
        self.core.wake_up();
    }

    /// Runs the loop until `timeout` elapses (`None` waits forever) or
    /// [`SocketServer::wake_up`] is observed. With `process_io` false only
    /// the wake-up source is consulted. Returns an error only when the
    /// readiness primitive itself fails unrecoverably.
    pub fn wait(&self, timeout: Option<Duration>, process_io: bool) -> io::Result<()> {
        #[cfg(unix)]
        {
            select::wait(&self.core, timeout, process_io)
        }
        #[cfg(windows)]
        {
            wsa::wait(&self.core, timeout, process_io)
        }
    }

    /// Routes `signum` into `handler`, which runs on the loop thread
    /// during [`SocketServer::wait`] instead of in signal context.
    #[cfg(unix)]
    pub fn set_signal_handler(&self, signum: i32, handler: impl FnMut(i32) + Send + 'static) -> io::Result<()> {
        if !(0..signal::NUM_SIGNALS as i32).contains(&signum) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let mut slot = self.core.signals.lock().unwrap();
        if slot.is_none() {
            let fd = signal::router_fd()?;
            let dispatcher = Arc::new(SignalDispatcher::new(fd));
            let key = self.core.alloc_key();
            self.core
                .add_dispatcher_keyed(key, Arc::downgrade(&dispatcher) as Weak<dyn Dispatcher>);
            *slot = Some((key, dispatcher));
        }
        let (_, dispatcher) = slot.as_ref().expect("signal dispatcher just installed");
        dispatcher.set_handler(signum, Box::new(handler));
        signal::install_router(signum)
    }

    /// Restores the default disposition for `signum` and drops the signal
    /// dispatcher once no handlers remain.
    #[cfg(unix)]
    pub fn clear_signal_handler(&self, signum: i32) -> io::Result<()> {
        if !(0..signal::NUM_SIGNALS as i32).contains(&signum) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        signal::restore_default(signum)?;
        let mut slot = self.core.signals.lock().unwrap();
        if let Some((key, dispatcher)) = slot.as_ref() {
            dispatcher.clear_handler(signum);
            if !dispatcher.has_handlers() {
                self.core.remove_dispatcher_keyed(*key);
                *slot = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_socket::SocketHandler;
    use crate::event::EventSet;
    use crate::socket::ConnState;
    use std::io::Write;
    use std::net::{SocketAddr, TcpStream};
    use std::thread;
    use std::time::Instant;

    fn wait_until(server: &SocketServer, mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            server.wait(Some(Duration::from_millis(50)), true).expect("wait failed");
        }
        panic!("condition not reached in time");
    }

    struct NullDispatcher;

    impl Dispatcher for NullDispatcher {
        fn requested_events(&self) -> EventSet {
            EventSet::NONE
        }

        fn on_pre_event(&self, _events: EventSet) {}

        fn on_event(&self, _events: EventSet, _error: i32) {}
    }

    #[test]
    fn should_ignore_duplicate_registration() {
        let server = SocketServer::new().expect("unable to create server");
        let dispatcher = Arc::new(NullDispatcher);
        let weak = Arc::downgrade(&dispatcher) as Weak<dyn Dispatcher>;

        let key = server.add_dispatcher(weak.clone());
        let len = server.core.registry.lock().unwrap().len();
        server.core.add_dispatcher_keyed(key, weak);
        assert_eq!(len, server.core.registry.lock().unwrap().len());

        server.remove_dispatcher(key);
        assert_eq!(len - 1, server.core.registry.lock().unwrap().len());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "removing a dispatcher that is not registered")]
    fn should_assert_on_double_remove() {
        let server = SocketServer::new().expect("unable to create server");
        let dispatcher = Arc::new(NullDispatcher);
        let key = server.add_dispatcher(Arc::downgrade(&dispatcher) as Weak<dyn Dispatcher>);
        server.remove_dispatcher(key);
        server.remove_dispatcher(key);
    }

    #[derive(Default)]
    struct StreamProbe {
        received: Vec<u8>,
        events: Vec<&'static str>,
        closes: usize,
        saw_would_block: bool,
        accepted: Option<Arc<AsyncSocket>>,
    }

    struct Acceptor {
        probe: Arc<Mutex<StreamProbe>>,
    }

    impl SocketHandler for Acceptor {
        fn on_readable(&mut self, listener: &AsyncSocket) {
            let (socket, _peer) = listener.accept().expect("accept failed");
            socket.set_handler(Reader { probe: self.probe.clone() });
            self.probe.lock().unwrap().accepted = Some(socket);
        }
    }

    struct Reader {
        probe: Arc<Mutex<StreamProbe>>,
    }

    impl SocketHandler for Reader {
        fn on_readable(&mut self, socket: &AsyncSocket) {
            let mut buf = [0u8; 64];
            loop {
                match socket.recv(&mut buf) {
                    Ok(n) => {
                        let mut probe = self.probe.lock().unwrap();
                        probe.received.extend_from_slice(&buf[..n]);
                        probe.events.push("read");
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.probe.lock().unwrap().saw_would_block = true;
                        break;
                    }
                    Err(err) => panic!("recv failed: {err}"),
                }
            }
        }

        fn on_closed(&mut self, _socket: &AsyncSocket, _error: i32) {
            let mut probe = self.probe.lock().unwrap();
            probe.closes += 1;
            probe.events.push("close");
        }
    }

    fn listening_socket(server: &SocketServer) -> (Arc<AsyncSocket>, SocketAddr) {
        let listener = server
            .create_async_socket(SocketType::Stream)
            .expect("unable to create listener");
        listener.bind("127.0.0.1:0".parse().unwrap()).expect("bind failed");
        listener.listen(8).expect("listen failed");
        let addr = listener.local_addr().expect("no local address");
        (listener, addr)
    }

    #[test]
    fn should_echo_bytes_over_loopback_tcp() {
        let server = SocketServer::new().expect("unable to create server");
        let (listener, addr) = listening_socket(&server);
        let probe = Arc::new(Mutex::new(StreamProbe::default()));
        listener.set_handler(Acceptor { probe: probe.clone() });

        let mut peer = TcpStream::connect(addr).expect("peer connect failed");
        peer.write_all(&[0x01, 0x02, 0x03]).expect("peer write failed");

        wait_until(&server, || probe.lock().unwrap().received.len() == 3);
        assert_eq!(vec![0x01, 0x02, 0x03], probe.lock().unwrap().received);

        drop(peer);
        wait_until(&server, || probe.lock().unwrap().closes == 1);
        assert_eq!(1, probe.lock().unwrap().closes);
    }

    #[test]
    fn should_defer_peer_close_to_the_next_cycle() {
        let server = SocketServer::new().expect("unable to create server");
        let (listener, addr) = listening_socket(&server);
        let probe = Arc::new(Mutex::new(StreamProbe::default()));
        listener.set_handler(Acceptor { probe: probe.clone() });

        let mut peer = TcpStream::connect(addr).expect("peer connect failed");
        peer.write_all(b"bye").expect("peer write failed");
        peer.shutdown(std::net::Shutdown::Write).expect("peer shutdown failed");

        wait_until(&server, || probe.lock().unwrap().closes == 1);

        let probe = probe.lock().unwrap();
        // the application saw data, then back-pressure, then exactly one
        // close; never a zero length read
        assert_eq!(b"bye".to_vec(), probe.received);
        assert!(probe.saw_would_block);
        assert_eq!(1, probe.closes);
        assert_eq!(Some(&"close"), probe.events.last());
        assert_eq!(1, probe.events.iter().filter(|&&e| e == "close").count());
        let accepted = probe.accepted.as_ref().expect("no accepted socket");
        assert_eq!(ConnState::Closed, accepted.state());
    }

    #[derive(Default)]
    struct DatagramProbe {
        data: Vec<u8>,
        from: Option<SocketAddr>,
    }

    struct DatagramReader {
        probe: Arc<Mutex<DatagramProbe>>,
    }

    impl SocketHandler for DatagramReader {
        fn on_readable(&mut self, socket: &AsyncSocket) {
            let mut buf = [0u8; 64];
            let (n, from) = socket.recv_from(&mut buf).expect("recv_from failed");
            let mut probe = self.probe.lock().unwrap();
            probe.data.extend_from_slice(&buf[..n]);
            probe.from = Some(from);
        }
    }

    #[test]
    fn should_exchange_datagrams_between_async_sockets() {
        let server = SocketServer::new().expect("unable to create server");

        let receiver = server
            .create_async_socket(SocketType::Datagram)
            .expect("unable to create receiver");
        receiver.bind("127.0.0.1:0".parse().unwrap()).expect("bind failed");
        let receiver_addr = receiver.local_addr().expect("no local address");

        let sender = server
            .create_async_socket(SocketType::Datagram)
            .expect("unable to create sender");
        sender.bind("127.0.0.1:0".parse().unwrap()).expect("bind failed");
        let sender_addr = sender.local_addr().expect("no local address");

        let probe = Arc::new(Mutex::new(DatagramProbe::default()));
        receiver.set_handler(DatagramReader { probe: probe.clone() });

        assert_eq!(4, sender.send_to(b"ping", receiver_addr).expect("send_to failed"));

        wait_until(&server, || !probe.lock().unwrap().data.is_empty());
        let probe = probe.lock().unwrap();
        assert_eq!(b"ping".to_vec(), probe.data);
        assert_eq!(Some(sender_addr), probe.from);
    }

    #[test]
    fn should_return_from_wait_on_wake_up() {
        let server = SocketServer::new().expect("unable to create server");
        let waker = server.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            waker.wake_up();
        });

        let start = Instant::now();
        server.wait(None, true).expect("wait failed");
        assert!(start.elapsed() < Duration::from_secs(2), "wake-up was not observed");
        handle.join().unwrap();
    }

    #[derive(Default)]
    struct CloseProbe {
        closes: usize,
        error: i32,
    }

    struct CloseRecorder {
        probe: Arc<Mutex<CloseProbe>>,
    }

    impl SocketHandler for CloseRecorder {
        fn on_closed(&mut self, _socket: &AsyncSocket, error: i32) {
            let mut probe = self.probe.lock().unwrap();
            probe.closes += 1;
            probe.error = error;
        }
    }

    #[test]
    fn should_close_socket_when_resolution_fails() {
        let server = SocketServer::new().expect("unable to create server");
        let socket = server
            .create_async_socket(SocketType::Stream)
            .expect("unable to create socket");
        let probe = Arc::new(Mutex::new(CloseProbe::default()));
        socket.set_handler(CloseRecorder { probe: probe.clone() });

        socket.connect_to("host.invalid", 80).expect("connect should start resolving");
        assert_eq!(ConnState::Connecting, socket.state());

        wait_until(&server, || probe.lock().unwrap().closes == 1);
        assert_eq!(ConnState::Closed, socket.state());
        assert_ne!(0, probe.lock().unwrap().error);
    }

    #[derive(Default)]
    struct ConnectProbe {
        connected: bool,
    }

    struct ConnectRecorder {
        probe: Arc<Mutex<ConnectProbe>>,
    }

    impl SocketHandler for ConnectRecorder {
        fn on_connected(&mut self, _socket: &AsyncSocket) {
            self.probe.lock().unwrap().connected = true;
        }
    }

    #[test]
    fn should_signal_connect_completion() {
        let server = SocketServer::new().expect("unable to create server");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("unable to bind listener");
        let addr = listener.local_addr().expect("no local address");

        let socket = server
            .create_async_socket(SocketType::Stream)
            .expect("unable to create socket");
        let probe = Arc::new(Mutex::new(ConnectProbe::default()));
        socket.set_handler(ConnectRecorder { probe: probe.clone() });

        socket
            .connect_to(&addr.ip().to_string(), addr.port())
            .expect("connect failed");

        // loopback connects may also complete synchronously, in which case
        // there is no pending CONNECT to signal
        wait_until(&server, || {
            probe.lock().unwrap().connected || socket.state() == ConnState::Connected
        });
        assert_eq!(ConnState::Connected, socket.state());
    }

    struct CountingReader {
        reads: Arc<Mutex<usize>>,
    }

    impl SocketHandler for CountingReader {
        fn on_readable(&mut self, socket: &AsyncSocket) {
            let mut buf = [0u8; 64];
            let _ = socket.recv_from(&mut buf);
            *self.reads.lock().unwrap() += 1;
        }
    }

    struct RemovingReader {
        victim: Arc<AsyncSocket>,
        reads: Arc<Mutex<usize>>,
    }

    impl SocketHandler for RemovingReader {
        fn on_readable(&mut self, socket: &AsyncSocket) {
            let mut buf = [0u8; 64];
            let _ = socket.recv_from(&mut buf);
            self.victim.close().expect("close failed");
            *self.reads.lock().unwrap() += 1;
        }
    }

    #[test]
    fn should_skip_dispatcher_removed_during_dispatch() {
        let server = SocketServer::new().expect("unable to create server");

        let first = server
            .create_async_socket(SocketType::Datagram)
            .expect("unable to create socket");
        first.bind("127.0.0.1:0".parse().unwrap()).expect("bind failed");
        let first_addr = first.local_addr().expect("no local address");

        let second = server
            .create_async_socket(SocketType::Datagram)
            .expect("unable to create socket");
        second.bind("127.0.0.1:0".parse().unwrap()).expect("bind failed");
        let second_addr = second.local_addr().expect("no local address");

        let first_reads = Arc::new(Mutex::new(0));
        let second_reads = Arc::new(Mutex::new(0));
        first.set_handler(RemovingReader {
            victim: second.clone(),
            reads: first_reads.clone(),
        });
        second.set_handler(CountingReader {
            reads: second_reads.clone(),
        });

        // make both sockets readable before the loop runs so they land in
        // the same dispatch pass
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").expect("unable to bind sender");
        sender.send_to(b"x", first_addr).expect("send failed");
        sender.send_to(b"x", second_addr).expect("send failed");

        wait_until(&server, || *first_reads.lock().unwrap() == 1);
        assert_eq!(0, *second_reads.lock().unwrap());
        assert_eq!(ConnState::Closed, second.state());

        // the registry keeps serving the surviving dispatcher
        sender.send_to(b"y", first_addr).expect("send failed");
        wait_until(&server, || *first_reads.lock().unwrap() == 2);
        assert_eq!(0, *second_reads.lock().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn should_route_posix_signal_into_wait() {
        let server = SocketServer::new().expect("unable to create server");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        server
            .set_signal_handler(libc::SIGUSR1, move |signum| sink.lock().unwrap().push(signum))
            .expect("unable to install signal handler");

        unsafe { libc::raise(libc::SIGUSR1) };

        wait_until(&server, || !seen.lock().unwrap().is_empty());
        assert_eq!(vec![libc::SIGUSR1], *seen.lock().unwrap());
        server.clear_signal_handler(libc::SIGUSR1).expect("unable to clear handler");
    }
}
