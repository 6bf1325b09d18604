//! Non-blocking socket state machine and the raw (non dispatcher) socket.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use log::warn;
use socket2::{Domain, SockAddr, Socket as OsSocket, Type};

use crate::dispatcher::{RawHandle, INVALID_HANDLE};
use crate::dns::LookupHandle;
use crate::event::EventSet;
use crate::sys;

#[cfg(unix)]
use std::os::fd::AsRawFd;
#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

/// Transport flavour of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

impl From<SocketType> for Type {
    fn from(ty: SocketType) -> Type {
        match ty {
            SocketType::Stream => Type::STREAM,
            SocketType::Datagram => Type::DGRAM,
        }
    }
}

/// Connection lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    Connected,
}

/// Logical socket options translated to their platform representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Forbid IP fragmentation of outgoing datagrams. Not available on
    /// every BSD derived stack; unsupported platforms report an error
    /// without touching socket state.
    DontFragment,
    RecvBuffer,
    SendBuffer,
    NoDelay,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const SEND_FLAGS: i32 = 0;
#[cfg(windows)]
const SEND_FLAGS: i32 = 0;

/// Resolution attempt owned by a connecting socket. The handle cancels the
/// lookup when dropped, so tearing it down on close is enough to keep the
/// completion from ever reaching the socket.
pub(crate) struct PendingResolve {
    pub seq: u64,
    pub lookup: Option<LookupHandle>,
}

/// State shared by [`Socket`] and the dispatcher socket: one OS handle, the
/// enabled-events mask consumed by the loop, the last OS error and the
/// connection state.
pub(crate) struct SocketCore {
    sock: Option<OsSocket>,
    enabled: EventSet,
    error: i32,
    state: ConnState,
    udp: bool,
    resolve: Option<PendingResolve>,
    #[cfg(debug_assertions)]
    dbg_addr: String,
}

impl SocketCore {
    pub fn new() -> SocketCore {
        SocketCore {
            sock: None,
            enabled: EventSet::NONE,
            error: 0,
            state: ConnState::Closed,
            udp: false,
            resolve: None,
            #[cfg(debug_assertions)]
            dbg_addr: String::new(),
        }
    }

    /// Adopts an already-connected OS socket, e.g. one returned by `accept`.
    pub fn from_os_socket(sock: OsSocket) -> io::Result<SocketCore> {
        let udp = sock.r#type()? == Type::DGRAM;
        let mut core = SocketCore::new();
        core.sock = Some(sock);
        core.udp = udp;
        core.state = ConnState::Connected;
        core.enabled = EventSet::READ | EventSet::WRITE;
        Ok(core)
    }

    /// Creates the underlying OS socket, closing any previous handle first.
    pub fn open(&mut self, ty: SocketType) -> io::Result<()> {
        self.close();
        let sock = self.record(OsSocket::new(Domain::IPV4, ty.into(), None))?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        sock.set_nosigpipe(true)?;
        self.sock = Some(sock);
        self.udp = ty == SocketType::Datagram;
        if self.udp {
            self.enabled = EventSet::READ | EventSet::WRITE;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    pub fn handle(&self) -> RawHandle {
        match &self.sock {
            #[cfg(unix)]
            Some(sock) => sock.as_raw_fd(),
            #[cfg(windows)]
            Some(sock) => sock.as_raw_socket(),
            None => INVALID_HANDLE,
        }
    }

    pub fn enabled(&self) -> EventSet {
        self.enabled
    }

    pub fn disable(&mut self, events: EventSet) {
        self.enabled -= events;
    }

    pub fn clear_enabled(&mut self) {
        self.enabled = EventSet::NONE;
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub fn last_error(&self) -> i32 {
        self.error
    }

    pub fn set_error(&mut self, error: i32) {
        self.error = error;
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let addr = self.os_socket()?.local_addr().inspect_err(|err| {
            warn!("unable to get local address: {err}");
        })?;
        sock_to_addr(addr)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let addr = self.os_socket()?.peer_addr().inspect_err(|err| {
            warn!("unable to get peer address: {err}");
        })?;
        sock_to_addr(addr)
    }

    pub fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        let res = self.os_socket()?.bind(&SockAddr::from(addr));
        self.record(res)?;
        #[cfg(debug_assertions)]
        {
            self.dbg_addr = format!("bound @ {}", self.local_addr().map_or_else(|_| addr.to_string(), |a| a.to_string()));
        }
        Ok(())
    }

    /// Kicks off (or completes) a connect to an already resolved address.
    pub fn do_connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let res = self.os_socket()?.connect(&SockAddr::from(addr));
        match res {
            Ok(()) => {
                self.error = 0;
                self.state = ConnState::Connected;
                #[cfg(debug_assertions)]
                {
                    self.dbg_addr = format!("connected @ {addr}");
                }
            }
            Err(err) if sys::is_blocking_error(sys::os_error_code(&err)) => {
                self.error = sys::os_error_code(&err);
                self.state = ConnState::Connecting;
                self.enabled |= EventSet::CONNECT;
                #[cfg(debug_assertions)]
                {
                    self.dbg_addr = format!("connecting @ {addr}");
                }
            }
            Err(err) => {
                self.error = sys::os_error_code(&err);
                return Err(err);
            }
        }
        self.enabled |= EventSet::READ | EventSet::WRITE;
        Ok(())
    }

    pub fn listen(&mut self, backlog: i32) -> io::Result<()> {
        let res = self.os_socket()?.listen(backlog);
        self.record(res)?;
        self.state = ConnState::Connecting;
        self.enabled |= EventSet::ACCEPT;
        #[cfg(debug_assertions)]
        {
            if let Ok(addr) = self.local_addr() {
                self.dbg_addr = format!("listening @ {addr}");
            }
        }
        Ok(())
    }

    /// Accepts one pending connection and re-arms `ACCEPT`.
    pub fn accept_os_socket(&mut self) -> io::Result<(OsSocket, SocketAddr)> {
        let res = self.os_socket()?.accept();
        let (sock, addr) = self.record(res)?;
        self.enabled |= EventSet::ACCEPT;
        Ok((sock, sock_to_addr(addr)?))
    }

    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.os_socket()?.send_with_flags(buf, SEND_FLAGS);
        let res = self.record(res);
        match &res {
            Ok(sent) => debug_assert!(*sent <= buf.len()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.enabled |= EventSet::WRITE,
            Err(_) => {}
        }
        res
    }

    pub fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let res = self.os_socket()?.send_to_with_flags(buf, &SockAddr::from(addr), SEND_FLAGS);
        let res = self.record(res);
        match &res {
            Ok(sent) => debug_assert!(*sent <= buf.len()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.enabled |= EventSet::WRITE,
            Err(_) => {}
        }
        res
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = self.os_socket()?.recv(as_uninit(buf));
        if let Ok(0) = res {
            if !buf.is_empty() {
                // Graceful peer shutdown. Pretend the read would block and
                // re-arm READ so the next wait cycle observes the close;
                // callers never see a zero length stream read.
                warn!("eof from peer, deferring close event");
                self.enabled |= EventSet::READ;
                let err = io::Error::from(io::ErrorKind::WouldBlock);
                self.error = sys::os_error_code(&err);
                return Err(err);
            }
        }
        let res = self.record(res);
        self.rearm_read(&res);
        res
    }

    pub fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let res = self.os_socket()?.recv_from(as_uninit(buf));
        let res = self.record(res);
        self.rearm_read(&res);
        let (n, addr) = res?;
        Ok((n, sock_to_addr(addr)?))
    }

    /// Streams re-arm READ unless the call failed hard; datagram sockets
    /// always re-arm so a bad packet cannot wedge the receive path.
    fn rearm_read<T>(&mut self, res: &io::Result<T>) {
        let success = match res {
            Ok(_) => true,
            Err(err) => sys::is_blocking_error(sys::os_error_code(err)),
        };
        if self.udp || success {
            self.enabled |= EventSet::READ;
        }
    }

    pub fn get_option(&mut self, opt: SocketOption) -> io::Result<i32> {
        let sock = self.os_socket()?;
        let res = match opt {
            SocketOption::NoDelay => sock.nodelay().map(i32::from),
            SocketOption::RecvBuffer => sock.recv_buffer_size().map(|v| v as i32),
            SocketOption::SendBuffer => sock.send_buffer_size().map(|v| v as i32),
            SocketOption::DontFragment => get_dont_fragment(sock),
        };
        self.record(res)
    }

    pub fn set_option(&mut self, opt: SocketOption, value: i32) -> io::Result<()> {
        let sock = self.os_socket()?;
        let res = match opt {
            SocketOption::NoDelay => sock.set_nodelay(value != 0),
            SocketOption::RecvBuffer => sock.set_recv_buffer_size(value as usize),
            SocketOption::SendBuffer => sock.set_send_buffer_size(value as usize),
            SocketOption::DontFragment => set_dont_fragment(sock, value != 0),
        };
        self.record(res)
    }

    /// Estimates the MTU towards the connected peer. Linux reads the path
    /// MTU off the socket; platforms without an equivalent report
    /// `InvalidInput` and leave the choice to the caller.
    pub fn estimate_mtu(&mut self) -> io::Result<u16> {
        let peer = self.peer_addr().map_err(|err| {
            self.error = notconn_code();
            err
        })?;
        self.probe_mtu(peer)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn probe_mtu(&mut self, _peer: SocketAddr) -> io::Result<u16> {
        let fd = self.handle();
        let value = self.record(sys::posix::getsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MTU))?;
        debug_assert!((0..=65536).contains(&value));
        Ok(value as u16)
    }

    #[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
    fn probe_mtu(&mut self, _peer: SocketAddr) -> io::Result<u16> {
        self.error = libc::EINVAL;
        Err(io::Error::from_raw_os_error(libc::EINVAL))
    }

    #[cfg(windows)]
    fn probe_mtu(&mut self, peer: SocketAddr) -> io::Result<u16> {
        let mut pinger = sys::windows::IcmpPinger::new().map_err(|err| {
            self.error = sys::os_error_code(&err);
            err
        })?;
        match probe_link_mtu(&mut pinger, peer.ip()) {
            Some(mtu) => Ok(mtu),
            None => {
                let err = io::Error::from(io::ErrorKind::InvalidInput);
                self.error = sys::os_error_code(&err);
                Err(err)
            }
        }
    }

    pub(crate) fn begin_resolve(&mut self, seq: u64) {
        self.resolve = Some(PendingResolve { seq, lookup: None });
        self.state = ConnState::Connecting;
    }

    /// Attaches the cancellation handle for the resolve attempt `seq`. If a
    /// close slipped in between, the handle is dropped which cancels the
    /// lookup.
    pub(crate) fn attach_resolver(&mut self, seq: u64, lookup: LookupHandle) {
        match &mut self.resolve {
            Some(pending) if pending.seq == seq => pending.lookup = Some(lookup),
            _ => drop(lookup),
        }
    }

    /// Consumes the pending resolve if `seq` is still current.
    pub(crate) fn take_resolver(&mut self, seq: u64) -> Option<PendingResolve> {
        match &self.resolve {
            Some(pending) if pending.seq == seq => self.resolve.take(),
            _ => None,
        }
    }

    /// Closes the handle. Idempotent; always leaves the socket in
    /// `Closed` with no enabled events and no pending resolver.
    pub fn close(&mut self) {
        self.resolve = None;
        self.sock = None;
        self.state = ConnState::Closed;
        self.enabled = EventSet::NONE;
    }

    /// Peeks one byte to tell buffered data apart from end-of-stream.
    pub fn peek_closed(&self) -> bool {
        let Ok(sock) = self.os_socket() else {
            return true;
        };
        let mut byte = [MaybeUninit::<u8>::uninit(); 1];
        match sock.peek(&mut byte) {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) => match err.raw_os_error() {
                #[cfg(unix)]
                Some(libc::EBADF) | Some(libc::ECONNRESET) => true,
                #[cfg(windows)]
                Some(windows_sys::Win32::Networking::WinSock::WSAECONNRESET) => true,
                _ => {
                    // Connection refused and friends surface as readable
                    // descriptors; anything unrecognised is treated as a
                    // blocking error and the next recv reports the close.
                    warn!("assuming benign blocking error on peek: {err}");
                    false
                }
            },
        }
    }

    pub fn set_nonblocking(&mut self) -> io::Result<()> {
        self.os_socket()?.set_nonblocking(true)
    }

    fn os_socket(&self) -> io::Result<&OsSocket> {
        self.sock.as_ref().ok_or_else(|| {
            #[cfg(unix)]
            let err = io::Error::from_raw_os_error(libc::EBADF);
            #[cfg(windows)]
            let err = io::Error::from_raw_os_error(windows_sys::Win32::Networking::WinSock::WSAENOTSOCK);
            err
        })
    }

    fn record<T>(&mut self, res: io::Result<T>) -> io::Result<T> {
        match &res {
            Ok(_) => self.error = 0,
            Err(err) => self.error = sys::os_error_code(err),
        }
        res
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        self.close();
    }
}

fn sock_to_addr(addr: SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an inet address"))
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: identical layout; the callee only writes initialized bytes.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

fn notconn_code() -> i32 {
    #[cfg(unix)]
    {
        libc::ENOTCONN
    }
    #[cfg(windows)]
    {
        windows_sys::Win32::Networking::WinSock::WSAENOTCONN
    }
}

pub(crate) fn already_code() -> i32 {
    #[cfg(unix)]
    {
        libc::EALREADY
    }
    #[cfg(windows)]
    {
        windows_sys::Win32::Networking::WinSock::WSAEALREADY
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn get_dont_fragment(sock: &OsSocket) -> io::Result<i32> {
    let value = sys::posix::getsockopt_int(sock.as_raw_fd(), libc::IPPROTO_IP, libc::IP_MTU_DISCOVER)?;
    Ok(i32::from(value != libc::IP_PMTUDISC_DONT))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_dont_fragment(sock: &OsSocket, value: bool) -> io::Result<()> {
    let value = if value { libc::IP_PMTUDISC_DO } else { libc::IP_PMTUDISC_DONT };
    sys::posix::setsockopt_int(sock.as_raw_fd(), libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, value)
}

#[cfg(windows)]
fn get_dont_fragment(sock: &OsSocket) -> io::Result<i32> {
    use windows_sys::Win32::Networking::WinSock::{IPPROTO_IP, IP_DONTFRAGMENT};
    sys::windows::getsockopt_int(sock.as_raw_socket(), IPPROTO_IP, IP_DONTFRAGMENT)
}

#[cfg(windows)]
fn set_dont_fragment(sock: &OsSocket, value: bool) -> io::Result<()> {
    use windows_sys::Win32::Networking::WinSock::{IPPROTO_IP, IP_DONTFRAGMENT};
    sys::windows::setsockopt_int(sock.as_raw_socket(), IPPROTO_IP, IP_DONTFRAGMENT, i32::from(value))
}

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
fn get_dont_fragment(_sock: &OsSocket) -> io::Result<i32> {
    warn!("DontFragment is not supported on this platform");
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
fn set_dont_fragment(_sock: &OsSocket, _value: bool) -> io::Result<()> {
    warn!("DontFragment is not supported on this platform");
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

// Standard MTUs from RFC 1191, probed largest first.
#[cfg(any(windows, test))]
const PACKET_MAXIMUMS: [u16; 11] = [65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296, 68];

#[cfg(any(windows, test))]
const IP_HEADER_SIZE: u16 = 20;
#[cfg(any(windows, test))]
const ICMP_HEADER_SIZE: u16 = 8;

#[cfg(any(windows, test))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingOutcome {
    Delivered,
    TooLarge,
    Failed,
}

/// Echo prober contract behind the path MTU ladder.
#[cfg(any(windows, test))]
pub(crate) trait Pinger {
    fn ping(&mut self, dest: IpAddr, payload_len: u16) -> PingOutcome;
}

/// Walks the standard MTU ladder, probing each size minus the IP and ICMP
/// headers, and returns the largest size delivered without fragmentation.
#[cfg(any(windows, test))]
pub(crate) fn probe_link_mtu(pinger: &mut impl Pinger, dest: IpAddr) -> Option<u16> {
    for &size in PACKET_MAXIMUMS.iter() {
        match pinger.ping(dest, size - IP_HEADER_SIZE - ICMP_HEADER_SIZE) {
            PingOutcome::Failed => return None,
            PingOutcome::TooLarge => continue,
            PingOutcome::Delivered => return Some(size),
        }
    }
    None
}

/// Raw socket without event loop integration, handed out by the server
/// factory for the rare caller that wants blocking BSD semantics with the
/// same option and state surface as the dispatcher socket.
pub struct Socket {
    core: SocketCore,
}

impl Socket {
    pub(crate) fn open(ty: SocketType) -> io::Result<Socket> {
        let mut core = SocketCore::new();
        core.open(ty)?;
        Ok(Socket { core })
    }

    pub fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.core.bind(addr)
    }

    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        if !self.core.is_open() {
            self.core.open(SocketType::Stream)?;
        }
        self.core.do_connect(addr)
    }

    /// Connects to `host:port`, resolving the hostname synchronously.
    pub fn connect_to(&mut self, host: &str, port: u16) -> io::Result<()> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.connect(SocketAddr::new(ip, port));
        }
        if self.core.state() != ConnState::Closed {
            self.core.set_error(already_code());
            return Err(io::Error::from_raw_os_error(already_code()));
        }
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for host"))?;
        self.connect(addr)
    }

    pub fn listen(&mut self, backlog: i32) -> io::Result<()> {
        self.core.listen(backlog)
    }

    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.core.send(buf)
    }

    pub fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.core.send_to(buf, addr)
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.core.recv(buf)
    }

    pub fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.core.recv_from(buf)
    }

    pub fn get_option(&mut self, opt: SocketOption) -> io::Result<i32> {
        self.core.get_option(opt)
    }

    pub fn set_option(&mut self, opt: SocketOption, value: i32) -> io::Result<()> {
        self.core.set_option(opt, value)
    }

    pub fn estimate_mtu(&mut self) -> io::Result<u16> {
        self.core.estimate_mtu()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.core.peer_addr()
    }

    pub fn state(&self) -> ConnState {
        self.core.state()
    }

    pub fn last_error(&self) -> i32 {
        self.core.last_error()
    }

    pub fn close(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_stay_closed_after_repeated_close() {
        let mut socket = Socket::open(SocketType::Stream).expect("unable to create socket");
        socket.close();
        socket.close();
        assert_eq!(ConnState::Closed, socket.state());
    }

    #[test]
    fn should_report_bound_address() {
        let mut socket = Socket::open(SocketType::Datagram).expect("unable to create socket");
        socket.bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        let local = socket.local_addr().expect("local addr");
        assert_eq!("127.0.0.1".parse::<IpAddr>().unwrap(), local.ip());
        assert_ne!(0, local.port());
    }

    #[test]
    fn should_enable_read_and_write_for_datagram_sockets() {
        let mut core = SocketCore::new();
        core.open(SocketType::Datagram).expect("open");
        assert_eq!(EventSet::READ | EventSet::WRITE, core.enabled());

        core.open(SocketType::Stream).expect("reopen as stream");
        assert_eq!(EventSet::NONE, core.enabled());
    }

    #[test]
    fn should_enable_accept_when_listening() {
        let mut core = SocketCore::new();
        core.open(SocketType::Stream).expect("open");
        core.bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        core.listen(8).expect("listen");
        assert_eq!(ConnState::Connecting, core.state());
        assert!(core.enabled().contains(EventSet::ACCEPT));
    }

    #[test]
    fn should_record_error_on_failed_bind() {
        let mut core = SocketCore::new();
        core.open(SocketType::Stream).expect("open");
        // Binding to a non-local address must fail and leave a code behind.
        let err = core.bind("8.8.8.8:80".parse().unwrap()).expect_err("bind should fail");
        assert_ne!(0, core.last_error());
        assert_eq!(Some(core.last_error()), err.raw_os_error());
    }

    #[test]
    fn should_round_trip_nodelay_option() {
        let mut core = SocketCore::new();
        core.open(SocketType::Stream).expect("open");
        core.set_option(SocketOption::NoDelay, 1).expect("set nodelay");
        assert_eq!(1, core.get_option(SocketOption::NoDelay).expect("get nodelay"));
        core.set_option(SocketOption::NoDelay, 0).expect("clear nodelay");
        assert_eq!(0, core.get_option(SocketOption::NoDelay).expect("get nodelay"));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn should_round_trip_dont_fragment_option() {
        let mut core = SocketCore::new();
        core.open(SocketType::Datagram).expect("open");
        core.set_option(SocketOption::DontFragment, 1).expect("set df");
        assert_eq!(1, core.get_option(SocketOption::DontFragment).expect("get df"));
        core.set_option(SocketOption::DontFragment, 0).expect("clear df");
        assert_eq!(0, core.get_option(SocketOption::DontFragment).expect("get df"));
    }

    struct LadderPinger {
        // payload sizes above this limit report fragmentation
        link_mtu: u16,
        fail: bool,
    }

    impl Pinger for LadderPinger {
        fn ping(&mut self, _dest: IpAddr, payload_len: u16) -> PingOutcome {
            if self.fail {
                PingOutcome::Failed
            } else if payload_len + IP_HEADER_SIZE + ICMP_HEADER_SIZE > self.link_mtu {
                PingOutcome::TooLarge
            } else {
                PingOutcome::Delivered
            }
        }
    }

    #[test]
    fn should_select_largest_non_fragmenting_mtu() {
        let dest: IpAddr = "127.0.0.1".parse().unwrap();
        let mut pinger = LadderPinger { link_mtu: 1500, fail: false };
        assert_eq!(Some(1492), probe_link_mtu(&mut pinger, dest));

        let mut pinger = LadderPinger { link_mtu: 65535, fail: false };
        assert_eq!(Some(65535), probe_link_mtu(&mut pinger, dest));

        let mut pinger = LadderPinger { link_mtu: 296, fail: false };
        assert_eq!(Some(296), probe_link_mtu(&mut pinger, dest));
    }

    #[test]
    fn should_give_up_when_probe_fails() {
        let dest: IpAddr = "127.0.0.1".parse().unwrap();
        let mut pinger = LadderPinger { link_mtu: 1500, fail: true };
        assert_eq!(None, probe_link_mtu(&mut pinger, dest));
    }

    #[test]
    fn should_defer_close_on_zero_length_stream_read() {
        use std::io::Write;

        let mut listener = SocketCore::new();
        listener.open(SocketType::Stream).expect("open listener");
        listener.bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        listener.listen(1).expect("listen");
        let addr = listener.local_addr().expect("local addr");

        let mut peer = std::net::TcpStream::connect(addr).expect("connect");
        let (accepted, _) = listener.accept_os_socket().expect("accept");
        let mut core = SocketCore::from_os_socket(accepted).expect("adopt");

        peer.write_all(&[7u8, 8, 9]).expect("peer write");
        peer.shutdown(std::net::Shutdown::Write).expect("peer shutdown");

        let mut buf = [0u8; 16];
        assert_eq!(3, core.recv(&mut buf).expect("read payload"));
        assert_eq!([7, 8, 9], buf[..3]);

        // end-of-stream must surface as WouldBlock with READ re-armed
        core.disable(EventSet::READ);
        let err = core.recv(&mut buf).expect_err("expected deferred close");
        assert_eq!(io::ErrorKind::WouldBlock, err.kind());
        assert!(core.enabled().contains(EventSet::READ));
        assert!(core.peek_closed());

        // handler code collapses the back-pressure to "no progress"
        use crate::util::NoBlock;
        assert_eq!(0, core.recv(&mut buf).no_block().expect("no_block"));
    }
}
