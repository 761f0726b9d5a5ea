//! Reactor threads.
//!
//! A [`Dispatcher`] is one thread running a mio poll loop over the
//! connections assigned to it. Other threads talk to it only through its
//! request channel, so the loop itself owns the connection map and its
//! memory manager without locking.

mod interface;
mod pool;

pub(crate) use interface::{DispatcherInterface, DispatcherRequest};
pub use pool::{DispatcherPool, DispatcherPoolListener};

use crate::connection::{Connection, ConnectionInner};
use crate::error::Error;
use crate::handler::{ChainEvents, WriteOutcome};
use crate::memory::UnsyncMemoryManager;

use mio::{Events, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

// Internal constants for connection management
pub(crate) const WAKE_ID: usize = 2;

const REGISTERED_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer and poll sizes used by every dispatcher of a pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DispatcherSettings {
    pub(crate) poll_capacity: usize,
    pub(crate) read_buffer_preallocation_size: usize,
    pub(crate) read_buffer_min_size: usize,
}

/// Handle to one reactor thread.
///
/// Obtained from [`DispatcherPool::dispatchers()`]. Dropping the handle does
/// not stop the thread; the pool does that.
pub struct Dispatcher {
    name: String,
    interface: DispatcherInterface,
    open_connections: Arc<AtomicUsize>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Dispatcher {
    pub(crate) fn start(name: String, settings: DispatcherSettings) -> Result<Arc<Self>, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(WAKE_ID))?);
        let (sender, receiver) = channel();
        let open_connections = Arc::new(AtomicUsize::new(0));

        let reactor = Reactor {
            name: name.clone(),
            poll,
            poll_capacity: settings.poll_capacity.max(1),
            receiver,
            connections: HashMap::new(),
            memory: UnsyncMemoryManager::new(
                settings.read_buffer_preallocation_size,
                settings.read_buffer_min_size,
            ),
            open_connections: open_connections.clone(),
            retiring: false,
        };

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || reactor.run())?;

        Ok(Arc::new(Self {
            name,
            interface: DispatcherInterface { sender, waker },
            open_connections,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        }))
    }
}

// ============================================================================
// Public API
// ============================================================================

impl Dispatcher {
    /// Thread name, `"{pool-name}#{index}"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of connections assigned to this dispatcher and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Acquire)
    }

    /// Whether the reactor thread is still running.
    pub fn is_running(&self) -> bool {
        crate::lock(&self.thread)
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Snapshot of the connections registered with this dispatcher.
    ///
    /// Answered by the reactor thread. A stopped dispatcher returns nothing,
    /// and so does a call from the reactor thread itself (an inline
    /// callback), which could never be answered.
    pub fn registered(&self) -> Vec<Connection> {
        if thread::current().id() == self.thread_id {
            warn!(name = %self.name, "Connection snapshot requested on the reactor thread");
            return Vec::new();
        }
        let (tx, rx) = channel();
        if self
            .interface
            .request(DispatcherRequest::Registered { response: tx })
            .is_err()
        {
            return Vec::new();
        }
        rx.recv_timeout(REGISTERED_TIMEOUT).unwrap_or_default()
    }

    /// Stops the reactor thread, closing all of its connections immediately.
    pub fn shutdown(&self) {
        if self.interface.request(DispatcherRequest::Shutdown).is_err() {
            debug!(name = %self.name, "Dispatcher already stopped");
        }
        let thread = crate::lock(&self.thread).take();
        if let Some(thread) = thread {
            // A callback running inline on this reactor may shut it down
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!(name = %self.name, "Dispatcher thread panicked");
            }
        }
    }
}

// ============================================================================
// Crate-internal API
// ============================================================================

impl Dispatcher {
    pub(crate) fn interface(&self) -> DispatcherInterface {
        self.interface.clone()
    }

    /// Hands a connection to the reactor thread.
    pub(crate) fn register(&self, connection: Arc<ConnectionInner>) -> Result<(), Error> {
        self.open_connections.fetch_add(1, Ordering::AcqRel);
        let result = self
            .interface
            .request(DispatcherRequest::Register { connection });
        if result.is_err() {
            self.open_connections.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    /// Stops taking part in the pool. The thread keeps serving its
    /// connections and exits after the last one closes.
    pub(crate) fn retire(&self) {
        if self.interface.request(DispatcherRequest::Retire).is_err() {
            debug!(name = %self.name, "Dispatcher already stopped");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

// ============================================================================
// Reactor Loop
// ============================================================================

// State owned by the reactor thread
struct Reactor {
    name: String,
    poll: Poll,
    poll_capacity: usize,
    receiver: Receiver<DispatcherRequest>,
    connections: HashMap<usize, Arc<ConnectionInner>>,
    memory: UnsyncMemoryManager,
    open_connections: Arc<AtomicUsize>,
    retiring: bool,
}

impl Reactor {
    fn run(mut self) {
        info!(name = %self.name, "Dispatcher started");
        let mut events = Events::with_capacity(self.poll_capacity);

        loop {
            if !self.process_requests() {
                break;
            }

            // Is there anything left to do?
            if self.retiring && self.connections.is_empty() {
                info!(name = %self.name, "Retired dispatcher has no connections left");
                break;
            }

            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(name = %self.name, ?err, "Poll failed");
                break;
            }

            for event in events.iter() {
                let Token(id) = event.token();

                if id == WAKE_ID {
                    // Requests are processed at the top of the loop
                    continue;
                }
                if !self.connections.contains_key(&id) {
                    trace!(id, "Event for a connection that is already closed");
                    continue;
                }

                // mio reports errors alongside readable/writable bits; the
                // read or write attempt surfaces the actual failure.
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.handle_readable(id);
                }
                if event.is_writable() && self.connections.contains_key(&id) {
                    self.handle_writable(id);
                }
            }
        }

        self.close_all();
        info!(name = %self.name, "Dispatcher stopped");
    }

    // Returns false once a shutdown was requested.
    fn process_requests(&mut self) -> bool {
        loop {
            let request = match self.receiver.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            };
            trace!(?request, "Dispatcher request");

            match request {
                DispatcherRequest::Register { connection } => self.register(connection),
                DispatcherRequest::Flush { id } => self.handle_writable(id),
                DispatcherRequest::Close { id, immediate } => {
                    if immediate {
                        self.close_connection(id);
                    } else {
                        self.handle_writable(id);
                    }
                }
                DispatcherRequest::Registered { response } => {
                    let connections = self
                        .connections
                        .values()
                        .map(|inner| Connection::from_inner(inner.clone()))
                        .collect();
                    // The caller may have given up waiting
                    let _ = response.send(connections);
                }
                DispatcherRequest::Retire => {
                    info!(name = %self.name, open = self.connections.len(), "Dispatcher retiring");
                    self.retiring = true;
                }
                DispatcherRequest::Shutdown => return false,
            }
        }
    }

    #[instrument(skip(self, connection), fields(id = connection.id()))]
    fn register(&mut self, connection: Arc<ConnectionInner>) {
        let id = connection.id();
        let mut events = ChainEvents::default();

        let result = {
            let mut chain = connection.chain();
            let registry = self.poll.registry();
            let result = chain
                .register(registry)
                .and_then(|_| chain.on_registered(&mut events))
                .and_then(|_| {
                    if chain.pending_write_size() > 0 {
                        chain.on_writable(registry).map(|_| ())
                    } else {
                        Ok(())
                    }
                });
            connection.enqueue(&mut events);
            result
        };

        match result {
            Ok(()) => {
                debug!(name = %self.name, "Connection registered");
                self.connections.insert(id, connection.clone());
                connection.dispatch(events);
            }
            Err(err) => {
                error!(?err, "Failed to register connection");
                self.connections.insert(id, connection);
                self.close_connection(id);
            }
        }
    }

    fn handle_readable(&mut self, id: usize) {
        let Some(connection) = self.connections.get(&id).cloned() else {
            return;
        };
        let mut events = ChainEvents::default();

        let result = {
            let mut chain = connection.chain();
            let result = chain.on_readable(&self.memory, &mut events).and_then(|_| {
                // Handshake records produced while reading go out right away
                if chain.pending_write_size() > 0 {
                    chain.on_writable(self.poll.registry())
                } else {
                    Ok(WriteOutcome::Drained)
                }
            });
            connection.enqueue(&mut events);
            result
        };

        // Data read before a failure is still delivered
        connection.dispatch(events);

        match result {
            Ok(WriteOutcome::CloseNow) => self.close_connection(id),
            Ok(_) => {}
            Err(Error::ConnectionClosed) => {
                debug!(id, "Connection closed by peer");
                self.close_connection(id);
            }
            Err(err) => {
                warn!(id, ?err, "Closing connection after read failure");
                self.close_connection(id);
            }
        }
    }

    fn handle_writable(&mut self, id: usize) {
        let Some(connection) = self.connections.get(&id).cloned() else {
            trace!(id, "Write request for a connection that is already closed");
            return;
        };

        let result = connection.chain().on_writable(self.poll.registry());
        match result {
            Ok(WriteOutcome::CloseNow) => self.close_connection(id),
            Ok(WriteOutcome::Drained) | Ok(WriteOutcome::Pending) => {}
            Err(err) => {
                warn!(id, ?err, "Closing connection after write failure");
                self.close_connection(id);
            }
        }
    }

    fn close_connection(&mut self, id: usize) {
        let Some(connection) = self.connections.remove(&id) else {
            return;
        };

        {
            let mut chain = connection.chain();
            chain.deregister(self.poll.registry());
            chain.on_disconnect();
        }

        self.open_connections.fetch_sub(1, Ordering::AcqRel);
        info!(id, name = %self.name, "Connection closed");
        connection.closed();
    }

    fn close_all(&mut self) {
        let ids: Vec<usize> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id);
        }
    }
}
