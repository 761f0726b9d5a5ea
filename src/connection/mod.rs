//! The application-facing connection.
//!
//! A [`Connection`] is a cheap, cloneable handle. It owns the receive queue
//! the application reads frames from and forwards writes into the handler
//! chain. The reactor thread fills the receive queue and schedules the
//! [`ConnectionHandler`] callbacks.
//!
//! Lock order: the handler chain before the receive queue.

mod handler;

pub(crate) use handler::Callback;
pub use handler::{CallbackModes, ConnectionHandler, HandlerDescriptor, HandlerPrototype};

use crate::error::Error;
use crate::handler::{ChainEvents, IoHandler, IoStats};
use crate::queue::{ByteSink, FrameQueue};
use crate::watchdog::{TimeoutCheck, Watchdog};
use crate::worker::{Executor, SerialExecutor};

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// ============================================================================
// Connection State
// ============================================================================

// Everything needed to build a connection
pub(crate) struct NewConnection {
    pub(crate) id: usize,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) chain: Box<dyn IoHandler>,
    pub(crate) stats: Arc<IoStats>,
    pub(crate) handler: Arc<dyn ConnectionHandler>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) watchdog: Arc<Watchdog>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) connection_timeout: Option<Duration>,
}

pub(crate) struct ConnectionInner {
    id: usize,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    chain: Mutex<Box<dyn IoHandler>>,
    read_queue: Mutex<FrameQueue>,
    // Signalled with the read queue lock held when data arrives or the
    // socket closes
    data_signal: Condvar,
    handler: Arc<dyn ConnectionHandler>,
    descriptor: HandlerDescriptor,
    serial: SerialExecutor,
    stats: Arc<IoStats>,
    watchdog: Arc<Watchdog>,
    // Logical state; cleared as soon as a close is requested
    open: AtomicBool,
    // Set once the reactor has closed the socket
    closed: AtomicBool,
    connect_notified: AtomicBool,
    disconnect_notified: AtomicBool,
    // Zero means no timeout
    idle_timeout_ms: AtomicU64,
    connection_timeout_ms: AtomicU64,
    idle_fired: AtomicBool,
    connection_timeout_fired: AtomicBool,
}

impl ConnectionInner {
    pub(crate) fn new(parts: NewConnection) -> Arc<Self> {
        let descriptor = parts.handler.descriptor();
        let inner = Arc::new(Self {
            id: parts.id,
            local_addr: parts.local_addr,
            peer_addr: parts.peer_addr,
            chain: Mutex::new(parts.chain),
            read_queue: Mutex::new(FrameQueue::new()),
            data_signal: Condvar::new(),
            handler: parts.handler,
            descriptor,
            serial: SerialExecutor::new(parts.executor),
            stats: parts.stats,
            watchdog: parts.watchdog,
            open: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            connect_notified: AtomicBool::new(false),
            disconnect_notified: AtomicBool::new(false),
            idle_timeout_ms: AtomicU64::new(0),
            connection_timeout_ms: AtomicU64::new(0),
            idle_fired: AtomicBool::new(false),
            connection_timeout_fired: AtomicBool::new(false),
        });
        if let Some(timeout) = parts.idle_timeout {
            inner.set_idle_timeout(timeout);
        }
        if let Some(timeout) = parts.connection_timeout {
            inner.set_connection_timeout(timeout);
        }
        inner
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn chain(&self) -> MutexGuard<'_, Box<dyn IoHandler>> {
        crate::lock(&self.chain)
    }

    fn read_queue(&self) -> MutexGuard<'_, FrameQueue> {
        crate::lock(&self.read_queue)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        self.idle_fired.store(false, Ordering::Relaxed);
        self.watchdog.require_period(timeout);
    }

    fn set_connection_timeout(&self, timeout: Duration) {
        self.connection_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        self.connection_timeout_fired.store(false, Ordering::Relaxed);
        self.watchdog.require_period(timeout);
    }
}

// ============================================================================
// Notifications
// ============================================================================

impl ConnectionInner {
    /// Moves received data into the receive queue.
    ///
    /// Callers hold the chain lock, so a switch to secured mode sees every
    /// byte that was read as plaintext.
    pub(crate) fn enqueue(&self, events: &mut ChainEvents) {
        if events.data.is_empty() {
            return;
        }
        self.read_queue().append_all(std::mem::take(&mut events.data));
        self.data_signal.notify_all();
        self.idle_fired.store(false, Ordering::Relaxed);
        events.received = true;
    }

    /// Delivers what a chain call produced: received data goes into the
    /// receive queue, then the callbacks are scheduled.
    pub(crate) fn dispatch(self: &Arc<Self>, mut events: ChainEvents) {
        self.enqueue(&mut events);
        if events.connected {
            self.notify_connect();
        }
        if events.received {
            self.notify_data();
        }
    }

    /// Called by the reactor after the socket is closed.
    pub(crate) fn closed(self: &Arc<Self>) {
        self.open.store(false, Ordering::Release);
        {
            let _queue = self.read_queue();
            self.closed.store(true, Ordering::Release);
            self.data_signal.notify_all();
        }

        if self.connect_notified.load(Ordering::Acquire)
            && !self.disconnect_notified.swap(true, Ordering::AcqRel)
        {
            self.run(Callback::Disconnect, |connection| {
                connection.inner.handler.on_disconnect(connection)
            });
        }
    }

    fn notify_connect(self: &Arc<Self>) {
        if self.connect_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(id = self.id, local_addr = %self.local_addr, peer_addr = %self.peer_addr, "Connection established");
        self.run(Callback::Connect, |connection| {
            connection.inner.handler.on_connect(connection)
        });
    }

    fn notify_data(self: &Arc<Self>) {
        self.run(Callback::Data, data_loop);
    }

    /// Fires the timeouts that are due. Each fires once; data arrival
    /// re-arms the idle timeout.
    pub(crate) fn check_timeouts(self: &Arc<Self>, now: Instant) -> TimeoutCheck {
        let mut fired = TimeoutCheck::default();
        if !self.open.load(Ordering::Acquire) || self.is_closed() {
            return fired;
        }

        let connection_timeout = self.connection_timeout_ms.load(Ordering::Relaxed);
        if connection_timeout > 0
            && self.stats.open_for(now) >= Duration::from_millis(connection_timeout)
            && !self.connection_timeout_fired.swap(true, Ordering::AcqRel)
        {
            info!(id = self.id, timeout_ms = connection_timeout, "Connection timeout");
            fired.connection = true;
            self.run(Callback::Timeout, |connection| {
                let handled = connection.inner.handler.on_connection_timeout(connection)?;
                if !handled {
                    warn!(id = connection.id(), "Connection timeout not handled, closing");
                    connection.close_immediately()?;
                }
                Ok(handled)
            });
        }

        let idle_timeout = self.idle_timeout_ms.load(Ordering::Relaxed);
        if idle_timeout > 0
            && self.stats.idle_for(now) >= Duration::from_millis(idle_timeout)
            && !self.idle_fired.swap(true, Ordering::AcqRel)
        {
            info!(id = self.id, timeout_ms = idle_timeout, "Idle timeout");
            fired.idle = true;
            self.run(Callback::Timeout, |connection| {
                let handled = connection.inner.handler.on_idle_timeout(connection)?;
                if !handled {
                    warn!(id = connection.id(), "Idle timeout not handled, closing");
                    connection.close_immediately()?;
                }
                Ok(handled)
            });
        }

        fired
    }

    // Runs a callback inline or on the serial executor, as the descriptor says.
    fn run<F>(self: &Arc<Self>, callback: Callback, f: F)
    where
        F: FnOnce(&Connection) -> Result<bool, Error> + Send + 'static,
    {
        let connection = Connection::from_inner(self.clone());
        if self.descriptor.threaded(callback) {
            self.serial
                .execute(Box::new(move || connection.invoke(callback, f)));
        } else {
            connection.invoke(callback, f);
        }
    }
}

// Calls `on_data` while data is left and the handler keeps consuming it.
fn data_loop(connection: &Connection) -> Result<bool, Error> {
    let mut handled = false;
    loop {
        let version = {
            let queue = connection.inner.read_queue();
            if queue.is_empty() {
                break;
            }
            queue.version()
        };

        handled = connection.inner.handler.on_data(connection)?;

        let queue = connection.inner.read_queue();
        if queue.is_empty() || queue.version() == version {
            break;
        }
    }
    Ok(handled)
}

// ============================================================================
// Connection Handle
// ============================================================================

/// A TCP connection as seen by the application.
///
/// Framing reads return `Ok(None)` while not enough data has arrived; the
/// handler is called again on the next arrival. On a connection that is
/// already closed they fail with [`Error::ConnectionClosed`] instead.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    fn invoke<F>(&self, callback: Callback, f: F)
    where
        F: FnOnce(&Connection) -> Result<bool, Error>,
    {
        match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                error!(id = self.id(), ?callback, %err, "Handler callback failed, closing connection");
                let _ = self.close_immediately();
            }
            Err(_) => {
                error!(id = self.id(), ?callback, "Handler callback panicked, closing connection");
                let _ = self.close_immediately();
            }
        }
    }

    pub(crate) fn check_timeouts(&self, now: Instant) -> TimeoutCheck {
        self.inner.check_timeouts(now)
    }

    fn underflow<T>(&self) -> Result<Option<T>, Error> {
        if self.inner.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(None)
        }
    }
}

// ============================================================================
// Identity and Statistics
// ============================================================================

impl Connection {
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// `false` once a close was requested or the peer went away.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire) && !self.inner.is_closed()
    }

    pub fn received_bytes(&self) -> u64 {
        self.inner.stats.received_bytes()
    }

    pub fn sent_bytes(&self) -> u64 {
        self.inner.stats.sent_bytes()
    }

    pub fn opened_at(&self) -> Instant {
        self.inner.stats.opened_at()
    }

    pub fn last_received_at(&self) -> Instant {
        self.inner.stats.last_received_at()
    }

    pub fn last_sent_at(&self) -> Instant {
        self.inner.stats.last_sent_at()
    }

    /// Bytes queued for sending and not yet written to the socket.
    pub fn pending_write_size(&self) -> usize {
        self.inner.chain().pending_write_size()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.inner.idle_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Sets the idle timeout and re-arms it.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.inner.set_idle_timeout(timeout);
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        match self.inner.connection_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.inner.set_connection_timeout(timeout);
    }
}

// ============================================================================
// Writing
// ============================================================================

impl Connection {
    /// Queues `data` and asks the dispatcher to flush it. Writes on one
    /// connection reach the socket in call order.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.write_segments(vec![data.into()])
    }

    pub fn write_segments(&self, data: Vec<Bytes>) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let mut chain = self.inner.chain();
        chain.write(data)?;
        chain.flush()
    }

    pub fn write_str(&self, text: &str) -> Result<(), Error> {
        self.write(Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn write_u8(&self, value: u8) -> Result<(), Error> {
        self.write(Bytes::copy_from_slice(&[value]))
    }

    pub fn write_u16(&self, value: u16) -> Result<(), Error> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn write_u32(&self, value: u32) -> Result<(), Error> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn write_u64(&self, value: u64) -> Result<(), Error> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn write_i32(&self, value: i32) -> Result<(), Error> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn write_i64(&self, value: i64) -> Result<(), Error> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn write_f64(&self, value: f64) -> Result<(), Error> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }
}

// ============================================================================
// Reading
// ============================================================================

impl Connection {
    /// Number of received bytes not yet read.
    pub fn available(&self) -> usize {
        self.inner.read_queue().len()
    }

    /// Length of the data in front of `delimiter`, without consuming it.
    pub fn index_of(&self, delimiter: &[u8], max_len: usize) -> Result<Option<usize>, Error> {
        match self.inner.read_queue().index_of(delimiter, max_len)? {
            Some(len) => Ok(Some(len)),
            None => self.underflow(),
        }
    }

    /// Takes everything received so far. Never underflows.
    pub fn read_available(&self) -> Vec<Bytes> {
        self.inner.read_queue().read_available()
    }

    pub fn read_bytes_by_length(&self, len: usize) -> Result<Option<Bytes>, Error> {
        match self.inner.read_queue().read_bytes(len) {
            Some(bytes) => Ok(Some(bytes)),
            None => self.underflow(),
        }
    }

    /// Reads up to `delimiter` and drops the delimiter. `max_len` bounds the
    /// bytes consumed including the delimiter.
    pub fn read_bytes_by_delimiter(
        &self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Option<Bytes>, Error> {
        match self
            .inner
            .read_queue()
            .read_by_delimiter(delimiter, max_len)?
        {
            Some(segments) => Ok(Some(concat(segments))),
            None => self.underflow(),
        }
    }

    pub fn read_string_by_delimiter(
        &self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Option<String>, Error> {
        match self.read_bytes_by_delimiter(delimiter, max_len)? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    pub fn read_string_by_length(&self, len: usize) -> Result<Option<String>, Error> {
        match self.read_bytes_by_length(len)? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    /// Moves exactly `len` bytes into `sink`.
    pub fn transfer_to<S>(&self, len: usize, sink: &mut S) -> Result<Option<usize>, Error>
    where
        S: ByteSink + ?Sized,
    {
        if self.inner.read_queue().extract_into(len, sink) {
            Ok(Some(len))
        } else {
            self.underflow()
        }
    }

    fn read_array<const N: usize>(&self) -> Result<Option<[u8; N]>, Error> {
        let Some(bytes) = self.read_bytes_by_length(N)? else {
            return Ok(None);
        };
        let mut array = [0u8; N];
        array.copy_from_slice(&bytes);
        Ok(Some(array))
    }

    pub fn read_u8(&self) -> Result<Option<u8>, Error> {
        Ok(self.read_array::<1>()?.map(|b| b[0]))
    }

    pub fn read_u16(&self) -> Result<Option<u16>, Error> {
        Ok(self.read_array()?.map(u16::from_be_bytes))
    }

    pub fn read_u32(&self) -> Result<Option<u32>, Error> {
        Ok(self.read_array()?.map(u32::from_be_bytes))
    }

    pub fn read_u64(&self) -> Result<Option<u64>, Error> {
        Ok(self.read_array()?.map(u64::from_be_bytes))
    }

    pub fn read_i32(&self) -> Result<Option<i32>, Error> {
        Ok(self.read_array()?.map(i32::from_be_bytes))
    }

    pub fn read_i64(&self) -> Result<Option<i64>, Error> {
        Ok(self.read_array()?.map(i64::from_be_bytes))
    }

    pub fn read_f64(&self) -> Result<Option<f64>, Error> {
        Ok(self.read_array()?.map(f64::from_be_bytes))
    }

    /// Retries `read` until it yields a value, waiting for new data in
    /// between. Fails with [`Error::Timeout`] once `timeout` has passed.
    ///
    /// Meant for threads outside the handler callbacks, e.g. a client
    /// waiting for a reply. The handler's `on_data` must leave the bytes
    /// alone for this to see them.
    pub fn read_blocking<T, F>(&self, timeout: Duration, mut read: F) -> Result<T, Error>
    where
        F: FnMut(&Connection) -> Result<Option<T>, Error>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let version = self.inner.read_queue().version();
            if let Some(value) = read(self)? {
                return Ok(value);
            }

            let queue = self.inner.read_queue();
            if self.inner.is_closed() {
                // Nothing more will arrive; one last look at what is left
                drop(queue);
                return read(self)?.ok_or(Error::ConnectionClosed);
            }
            if queue.version() != version {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            let _ = self
                .inner
                .data_signal
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    // ------------------------------------------------------------------------
    // Read Mark
    // ------------------------------------------------------------------------

    /// Starts recording reads so a partial parse can be rolled back.
    pub fn mark_read_position(&self) {
        self.inner.read_queue().mark_read_position();
    }

    /// Puts back everything read since the mark.
    pub fn reset_to_read_mark(&self) -> bool {
        self.inner.read_queue().reset_to_read_mark()
    }

    pub fn remove_read_mark(&self) {
        self.inner.read_queue().remove_read_mark();
    }
}

fn concat(mut segments: Vec<Bytes>) -> Bytes {
    if segments.len() <= 1 {
        return segments.pop().unwrap_or_default();
    }
    let len = segments.iter().map(Bytes::len).sum();
    let mut joined = BytesMut::with_capacity(len);
    for segment in segments {
        joined.extend_from_slice(&segment);
    }
    joined.freeze()
}

// ============================================================================
// Closing
// ============================================================================

impl Connection {
    /// Closes after everything queued has been written.
    pub fn close(&self) -> Result<(), Error> {
        if !self.inner.open.swap(false, Ordering::AcqRel) || self.inner.is_closed() {
            return Ok(());
        }
        debug!(id = self.id(), "Closing connection");
        self.inner.chain().close(false)
    }

    /// Closes without waiting for queued data.
    pub fn close_immediately(&self) -> Result<(), Error> {
        self.inner.open.store(false, Ordering::Release);
        if self.inner.is_closed() {
            return Ok(());
        }
        debug!(id = self.id(), "Closing connection immediately");
        self.inner.chain().close(true)
    }
}

// ============================================================================
// Secured Mode
// ============================================================================

#[cfg(feature = "tls")]
impl Connection {
    /// Starts holding back received bytes for a coming TLS handshake while
    /// writes still go out as plaintext.
    pub fn prepare_secured_mode(&self) -> Result<(), Error> {
        let mut chain = self.inner.chain();
        let ssl = chain
            .ssl_handler()
            .ok_or(Error::SecuredModeUnavailable { id: self.id() })?;
        ssl.prepare_secured_mode();
        Ok(())
    }

    /// Switches the connection to TLS.
    ///
    /// Unread received bytes are handed to the TLS layer as the start of the
    /// handshake, followed by anything held back since
    /// [`prepare_secured_mode()`](Self::prepare_secured_mode). Without that
    /// earlier call the switch still sees every byte read so far; calling it
    /// before telling the peer to start the handshake keeps the peer's first
    /// record out of the plaintext callbacks.
    pub fn activate_secured_mode(&self) -> Result<(), Error> {
        let mut events = ChainEvents::default();
        let result = {
            let mut chain = self.inner.chain();
            let result = match chain.ssl_handler() {
                Some(ssl) => {
                    ssl.prepare_secured_mode();
                    let buffered = self.inner.read_queue().drain();
                    ssl.start_secured_mode(buffered, &mut events)
                        .and_then(|_| chain.flush())
                }
                None => Err(Error::SecuredModeUnavailable { id: self.id() }),
            };
            self.inner.enqueue(&mut events);
            result
        };
        self.inner.dispatch(events);

        if let Err(err) = &result {
            if !matches!(err, Error::SecuredModeUnavailable { .. }) {
                warn!(id = self.id(), %err, "Secured mode activation failed, closing connection");
                let _ = self.close_immediately();
            }
        }
        result
    }

    /// Whether the TLS handshake has completed on this connection.
    pub fn is_secure(&self) -> bool {
        self.inner
            .chain()
            .ssl_handler()
            .is_some_and(|ssl| ssl.is_secure())
    }

    /// The current state of the TLS layer, or `None` without one.
    pub fn ssl_mode(&self) -> Option<crate::ssl::SslMode> {
        self.inner.chain().ssl_handler().map(|ssl| ssl.mode())
    }
}

#[cfg(not(feature = "tls"))]
impl Connection {
    pub fn prepare_secured_mode(&self) -> Result<(), Error> {
        Err(Error::SecuredModeUnavailable { id: self.id() })
    }

    pub fn activate_secured_mode(&self) -> Result<(), Error> {
        Err(Error::SecuredModeUnavailable { id: self.id() })
    }

    pub fn is_secure(&self) -> bool {
        false
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}
