//! The central readiness loop.
//!
//! One `mio::Poll` instance multiplexes the listening socket and every live
//! connection. Connection interest is one-shot: armed with a readable
//! registration, deregistered the moment a readiness event is dispatched,
//! and re-armed by the handler at the end of a successful cycle. Dispatch is
//! offloaded to a worker pool so a slow multi-segment read cannot stall the
//! polling loop; the per-connection lock in the registry serializes handlers
//! for the same connection.
//!
//! Error or hangup events route straight to teardown, bypassing the handler.
//! A poll failure other than `Interrupted` is fatal and terminates the loop.

use crate::config::Config;
use crate::runtime::acceptor;
use crate::runtime::handler::{self, CycleTimeouts};
use crate::runtime::pool::WorkerPool;
use crate::runtime::registry::ConnectionRegistry;
use mio::event::Event;
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tracing::{debug, error, info};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Thread-safe handle for arming connection interest.
///
/// Registration works on the raw fd, which lets a worker thread re-arm a
/// connection it does not own. `mio::Registry` is itself thread-safe.
#[derive(Clone)]
pub struct PollHandle {
    registry: Arc<Registry>,
}

impl PollHandle {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Arm one-shot readable interest for `fd` under `token`.
    pub fn arm_readable(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    /// Silence `fd` until it is armed again.
    pub fn disarm(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }
}

/// Cross-thread shutdown trigger for a running server.
///
/// `request` is idempotent and safe to call from any thread, including a
/// signal handler bridge: it flips an atomic flag and wakes the poll.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    requested: AtomicBool,
    waker: Waker,
}

impl ShutdownHandle {
    fn new(waker: Waker) -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                requested: AtomicBool::new(false),
                waker,
            }),
        }
    }

    /// Ask the server to stop. Only the first call wakes the poll.
    pub fn request(&self) {
        if !self.inner.requested.swap(true, Ordering::SeqCst) {
            let _ = self.inner.waker.wake();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }
}

/// The echo server: listener, poll loop, worker pool, connection registry.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    poller: PollHandle,
    pool: WorkerPool,
    shutdown: ShutdownHandle,
    timeouts: CycleTimeouts,
    drain_after_echo: bool,
}

impl Server {
    /// Bind, listen, and set up the reactor. Any failure here is fatal.
    pub fn init(config: &Config) -> io::Result<Server> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let poller = PollHandle::new(poll.registry().try_clone()?);

        let std_listener = create_listener(addr)?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let workers = if config.workers == 0 {
            num_cpus()
        } else {
            config.workers
        };
        let pool = WorkerPool::new(workers)?;

        info!(
            addr = %local_addr,
            workers,
            buffer_size = config.buffer_size,
            max_connections = config.max_connections,
            "Server initialized"
        );

        Ok(Server {
            poll,
            events: Events::with_capacity(config.max_events),
            listener: Some(listener),
            local_addr,
            registry: Arc::new(ConnectionRegistry::new(
                config.max_connections,
                config.buffer_size,
            )),
            poller,
            pool,
            shutdown: ShutdownHandle::new(waker),
            timeouts: CycleTimeouts::default(),
            drain_after_echo: config.drain_after_echo,
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for requesting shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Block driving the readiness loop until shutdown is requested or the
    /// poll primitive fails fatally. Cleans up either way.
    pub fn run(&mut self) -> io::Result<()> {
        info!(addr = %self.local_addr, "Server listening");
        let result = self.event_loop();
        self.cleanup();
        result
    }

    fn event_loop(&mut self) -> io::Result<()> {
        loop {
            if self.shutdown.is_requested() {
                return Ok(());
            }

            if let Err(e) = self.poll.poll(&mut self.events, None) {
                // Transient interruption retries immediately; anything else
                // is fatal to the loop.
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                return Err(e);
            }

            for event in self.events.iter() {
                match event.token() {
                    WAKER_TOKEN => {} // shutdown flag is checked at loop top
                    LISTENER_TOKEN => {
                        if let Some(listener) = &self.listener {
                            acceptor::accept_batch(listener, &self.registry, &self.poller);
                        }
                    }
                    Token(id) => self.dispatch(id, event),
                }
            }
        }
    }

    /// Route one connection readiness event.
    ///
    /// Readable (even alongside a hangup flag) goes to the handler, which
    /// observes peer close as a zero-length read; a pure error/hangup event
    /// tears the connection down directly.
    fn dispatch(&self, id: usize, event: &Event) {
        if event.is_readable() {
            let stream = match self.registry.stream(id) {
                Some(stream) => stream,
                None => return,
            };

            // One-shot: silence the handle until the handler re-arms it.
            if let Err(e) = self.poller.disarm(stream.as_raw_fd()) {
                debug!(conn_id = id, error = %e, "Disarm failed");
            }

            let registry = Arc::clone(&self.registry);
            let poller = self.poller.clone();
            let timeouts = self.timeouts;
            let drain = self.drain_after_echo;
            self.pool
                .execute(move || handler::process(&registry, &poller, id, &timeouts, drain));
        } else if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            debug!(conn_id = id, "Error/hangup event");
            self.teardown(id);
        }
    }

    /// Tear down a connection from the reactor side.
    fn teardown(&self, id: usize) {
        // Serialize with any in-flight cycle before touching its state.
        if let Some(lock) = self.registry.guard(id) {
            let _serial = lock.lock().unwrap_or_else(PoisonError::into_inner);
            handler::close(&self.registry, &self.poller, id);
        }
    }

    fn cleanup(&mut self) {
        info!("Shutting down");

        // Stop accepting first.
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }

        // Let in-flight cycles finish, then drop every connection.
        self.pool.shutdown();
        for id in self.registry.ids() {
            self.teardown(id);
        }

        info!("Shutdown complete");
    }
}

/// Create the listening socket: reusable address, non-blocking, bound.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
