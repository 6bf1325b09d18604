//! Background hostname resolution feeding asynchronously connecting
//! sockets. Lookups run on a dedicated worker thread and deliver their
//! outcome through a caller supplied completion; a lookup can be cancelled
//! at any point before delivery, in which case the completion never runs.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use log::debug;
use smallstr::SmallString;
use smallvec::SmallVec;
use thiserror::Error;

use crate::sys;

const MAX_ADDRS_PER_LOOKUP: usize = 32;
const MAX_HOSTNAME_LEN_BEFORE_SPILL: usize = 64;
const MAX_QUEUED_LOOKUPS: usize = 256;

#[derive(Error, Debug)]
pub(crate) enum ResolveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("no address found for host")]
    NoAddress,
}

impl ResolveError {
    /// OS error code reported on the socket when resolution fails.
    pub fn os_code(&self) -> i32 {
        match self {
            ResolveError::Io(err) => sys::os_error_code(err),
            #[cfg(unix)]
            ResolveError::NoAddress => libc::EHOSTUNREACH,
            #[cfg(windows)]
            ResolveError::NoAddress => windows_sys::Win32::Networking::WinSock::WSAHOST_NOT_FOUND,
        }
    }
}

type Completion = Box<dyn FnOnce(Result<SocketAddr, ResolveError>) + Send>;

struct Lookup {
    host: SmallString<[u8; MAX_HOSTNAME_LEN_BEFORE_SPILL]>,
    port: u16,
    cancelled: Arc<AtomicBool>,
    deliver: Completion,
}

/// Cancellation side of a pending lookup. Dropping the handle cancels the
/// lookup, which guarantees the completion is never invoked afterwards.
pub(crate) struct LookupHandle {
    cancelled: Arc<AtomicBool>,
}

impl Drop for LookupHandle {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Handle to the resolver worker thread. Cloned freely; the worker exits
/// once every handle is gone.
#[derive(Clone)]
pub(crate) struct DnsService {
    requests: SyncSender<Lookup>,
}

impl DnsService {
    pub fn start() -> io::Result<DnsService> {
        let (tx, rx) = std::sync::mpsc::sync_channel(MAX_QUEUED_LOOKUPS);
        let builder = thread::Builder::new().name("netloop-dns".to_owned());
        builder.spawn(move || DnsWorker { requests: rx }.run())?;
        Ok(DnsService { requests: tx })
    }

    /// Queues a lookup of `host:port`. The completion runs on the worker
    /// thread unless the returned handle cancels it first.
    pub fn lookup(
        &self,
        host: &str,
        port: u16,
        deliver: impl FnOnce(Result<SocketAddr, ResolveError>) + Send + 'static,
    ) -> io::Result<LookupHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let lookup = Lookup {
            host: host.into(),
            port,
            cancelled: cancelled.clone(),
            deliver: Box::new(deliver),
        };
        self.requests.try_send(lookup).map_err(|err| match err {
            TrySendError::Full(_) => io::Error::new(io::ErrorKind::WouldBlock, "resolver queue full"),
            TrySendError::Disconnected(_) => io::Error::other("resolver worker is gone"),
        })?;
        Ok(LookupHandle { cancelled })
    }
}

struct DnsWorker {
    requests: Receiver<Lookup>,
}

impl DnsWorker {
    fn run(self) {
        for lookup in self.requests.iter() {
            Self::resolve(lookup);
        }
    }

    fn resolve(lookup: Lookup) {
        if lookup.cancelled.load(Ordering::SeqCst) {
            return;
        }
        debug!("resolving {}:{}", lookup.host, lookup.port);
        let result = Self::first_addr(&lookup.host, lookup.port);
        // A cancellation that raced the blocking lookup still wins: the
        // owner is gone and must not be called back.
        if lookup.cancelled.load(Ordering::SeqCst) {
            return;
        }
        (lookup.deliver)(result);
    }

    fn first_addr(host: &str, port: u16) -> Result<SocketAddr, ResolveError> {
        let addrs: SmallVec<[SocketAddr; MAX_ADDRS_PER_LOOKUP]> = (host, port)
            .to_socket_addrs()?
            .take(MAX_ADDRS_PER_LOOKUP)
            .collect();
        addrs.first().copied().ok_or(ResolveError::NoAddress)
    }
}
