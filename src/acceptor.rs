//! The accept loop.
//!
//! An [`Acceptor`] owns a listening socket and blocks in [`Acceptor::run()`]
//! accepting connections until its [`AcceptorHandle`] shuts it down. Every
//! accepted socket becomes a [`Connection`](crate::Connection) on the next
//! dispatcher of the context's pool.

use crate::connection::HandlerPrototype;
use crate::context::{IoContext, Side};
use crate::error::Error;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const LISTENER_ID: usize = 1;
const WAKE_ID: usize = 2;

// Back-off after an accept error that is not tied to one connection
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Listening socket plus its accept loop.
pub struct Acceptor {
    context: IoContext,
    prototype: HandlerPrototype,
    listener: TcpListener,
    local_addr: SocketAddr,
    poll: Poll,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

/// Stops a running [`Acceptor`] from another thread.
#[derive(Debug, Clone)]
pub struct AcceptorHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    local_addr: SocketAddr,
}

impl AcceptorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Makes `run()` return. Connections already accepted stay open.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            warn!(?err, "Failed to wake acceptor");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Acceptor {
    /// Binds the listening socket. Port 0 picks a free port; see
    /// [`local_addr()`](Self::local_addr).
    #[instrument(skip(context, addr, prototype))]
    pub fn bind<A: ToSocketAddrs>(
        context: &IoContext,
        addr: A,
        prototype: HandlerPrototype,
    ) -> Result<Self, Error> {
        let requested_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let mut listener = TcpListener::bind(requested_addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, Token(LISTENER_ID), Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(WAKE_ID))?);

        info!(%local_addr, "Listening for connections");

        Ok(Self {
            context: context.clone(),
            prototype,
            listener,
            local_addr,
            poll,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }
}

// ============================================================================
// Public API
// ============================================================================

impl Acceptor {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> AcceptorHandle {
        AcceptorHandle {
            shutdown: self.shutdown.clone(),
            waker: self.waker.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Accepts connections until shut down.
    ///
    /// Accept errors are logged and the loop goes on; only a failing poll
    /// ends it early.
    pub fn run(mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(16);

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, local_addr = %self.local_addr, "Acceptor poll failed");
                return Err(err.into());
            }

            for event in events.iter() {
                if event.token() == Token(LISTENER_ID) {
                    self.accept_connections();
                }
            }
        }

        info!(local_addr = %self.local_addr, "Acceptor stopped");
        if let Err(err) = self.poll.registry().deregister(&mut self.listener) {
            debug!(?err, "Failed to deregister listener");
        }
        Ok(())
    }

    /// Runs the accept loop on its own thread.
    pub fn spawn(self) -> Result<(AcceptorHandle, thread::JoinHandle<Result<(), Error>>), Error> {
        let handle = self.handle();
        let name = format!("acceptor-{}", self.local_addr.port());
        let thread = thread::Builder::new().name(name).spawn(move || self.run())?;
        Ok((handle, thread))
    }
}

// ============================================================================
// Internal Accepting
// ============================================================================

impl Acceptor {
    #[instrument(skip(self))]
    fn accept_connections(&mut self) {
        let local_addr = self.local_addr;

        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(?err, %peer_addr, "Failed to set TCP_NODELAY");
                    }
                    info!(%local_addr, %peer_addr, "Accepted connection");
                    if let Err(err) = self.context.open_connection(
                        stream,
                        peer_addr,
                        &self.prototype,
                        Side::Server,
                    ) {
                        error!(?err, %peer_addr, "Failed to open accepted connection");
                    }
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => {
                        // Further accepting would block, so we are done
                        break;
                    }
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, %local_addr, "Transient accept error");
                        continue;
                    }
                    _ => {
                        // e.g. out of file descriptors; pending connections
                        // stay in the backlog until the next readiness event
                        error!(?err, %local_addr, "Error accepting connection");
                        thread::sleep(ACCEPT_ERROR_BACKOFF);
                        break;
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("shut_down", &self.shutdown.load(Ordering::Acquire))
            .finish()
    }
}
