//! Always-registered dispatchers that inject out-of-band work into the
//! wait loop: the wake-up signaler and the resolver completion relay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[cfg(unix)]
use log::warn;

use crate::async_socket::AsyncSocket;
use crate::dispatcher::Dispatcher;
use crate::event::EventSet;

#[cfg(unix)]
use crate::dispatcher::RawHandle;
#[cfg(unix)]
use crate::sys::posix::SelfPipe;
#[cfg(windows)]
use crate::sys::windows::{RawWsaEvent, WsaEvent};

use std::io;

/// Edge-like signal source: `signal()` makes the loop's readiness wait
/// return; the byte (or event) is consumed in `on_pre_event` before any
/// callback runs. Pipes cannot auto-reset like an event object, so the
/// drain happens right before dispatch.
struct SignalSource {
    #[cfg(unix)]
    pipe: SelfPipe,
    #[cfg(unix)]
    signaled: Mutex<bool>,
    #[cfg(windows)]
    event: WsaEvent,
}

impl SignalSource {
    fn new() -> io::Result<SignalSource> {
        Ok(SignalSource {
            #[cfg(unix)]
            pipe: SelfPipe::new()?,
            #[cfg(unix)]
            signaled: Mutex::new(false),
            #[cfg(windows)]
            event: WsaEvent::new()?,
        })
    }

    fn signal(&self) {
        #[cfg(unix)]
        {
            let mut signaled = self.signaled.lock().unwrap();
            if !*signaled {
                if let Err(err) = self.pipe.write_byte() {
                    warn!("unable to signal wake-up pipe: {err}");
                    return;
                }
                *signaled = true;
            }
        }
        #[cfg(windows)]
        self.event.set();
    }

    fn consume(&self) {
        #[cfg(unix)]
        {
            let mut signaled = self.signaled.lock().unwrap();
            if *signaled {
                if let Err(err) = self.pipe.drain(4) {
                    warn!("unable to drain wake-up pipe: {err}");
                }
                *signaled = false;
            }
        }
        #[cfg(windows)]
        self.event.reset();
    }

    #[cfg(unix)]
    fn descriptor(&self) -> RawHandle {
        self.pipe.read_fd()
    }

    #[cfg(windows)]
    fn raw_event(&self) -> RawWsaEvent {
        self.event.raw()
    }
}

/// Clears the server's wait flag when signalled; this is how `wake_up`
/// breaks a concurrent `wait`.
pub(crate) struct Signaler {
    source: SignalSource,
    wait_flag: Arc<AtomicBool>,
}

impl Signaler {
    pub fn new(wait_flag: Arc<AtomicBool>) -> io::Result<Signaler> {
        Ok(Signaler {
            source: SignalSource::new()?,
            wait_flag,
        })
    }

    pub fn signal(&self) {
        self.source.signal();
    }
}

impl Dispatcher for Signaler {
    fn requested_events(&self) -> EventSet {
        #[cfg(unix)]
        {
            EventSet::READ
        }
        #[cfg(windows)]
        {
            EventSet::NONE
        }
    }

    #[cfg(unix)]
    fn descriptor(&self) -> RawHandle {
        self.source.descriptor()
    }

    fn on_pre_event(&self, _events: EventSet) {
        self.source.consume();
    }

    fn on_event(&self, _events: EventSet, _error: i32) {
        self.wait_flag.store(false, Ordering::SeqCst);
    }

    #[cfg(windows)]
    fn wsa_event(&self) -> RawWsaEvent {
        self.source.raw_event()
    }
}

/// Outcome of one hostname resolution, addressed to the socket that
/// started it. The sequence number lets the socket reject completions for
/// attempts that were torn down or superseded.
pub(crate) struct ResolveCompletion {
    pub socket: Weak<AsyncSocket>,
    pub seq: u64,
    pub result: Result<SocketAddr, i32>,
}

/// Carries resolver completions back onto the loop thread. The worker
/// queues a completion and signals; the next wait cycle replays it into
/// the owning socket from `on_event`.
pub(crate) struct ResolveRelay {
    source: SignalSource,
    completions: Mutex<Vec<ResolveCompletion>>,
}

impl ResolveRelay {
    pub fn new() -> io::Result<ResolveRelay> {
        Ok(ResolveRelay {
            source: SignalSource::new()?,
            completions: Mutex::new(Vec::new()),
        })
    }

    pub fn complete(&self, completion: ResolveCompletion) {
        self.completions.lock().unwrap().push(completion);
        self.source.signal();
    }
}

impl Dispatcher for ResolveRelay {
    fn requested_events(&self) -> EventSet {
        #[cfg(unix)]
        {
            EventSet::READ
        }
        #[cfg(windows)]
        {
            EventSet::NONE
        }
    }

    #[cfg(unix)]
    fn descriptor(&self) -> RawHandle {
        self.source.descriptor()
    }

    fn on_pre_event(&self, _events: EventSet) {
        self.source.consume();
    }

    fn on_event(&self, _events: EventSet, _error: i32) {
        let pending = std::mem::take(&mut *self.completions.lock().unwrap());
        for completion in pending {
            if let Some(socket) = completion.socket.upgrade() {
                socket.handle_resolve(completion.seq, completion.result);
            }
        }
    }

    #[cfg(windows)]
    fn wsa_event(&self) -> RawWsaEvent {
        self.source.raw_event()
    }
}
