//! TLS record layer for a handler chain.
//!
//! [`SslHandler`] decorates its successor: outgoing plaintext is wrapped into
//! records before it reaches the successor's send queue, and ciphertext the
//! successor reads is unwrapped before it goes up. The layer can be active
//! from the start or switched on mid-stream.

mod engine;
pub(crate) mod tls_config;

pub use engine::{EngineResult, EngineStatus, HandshakeStatus, SslEngine};

use crate::error::Error;
use crate::handler::{ChainEvents, IoHandler, IoHandlerCallback, WriteOutcome};
use crate::memory::{MemoryManager, SharedMemoryManager};
use crate::queue::FrameQueue;

use bytes::Bytes;
use mio::Registry;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};

// Largest TLS record plaintext, and the record with its overhead
const INITIAL_APP_BUFFER_SIZE: usize = 16 * 1024;
const INITIAL_NET_BUFFER_SIZE: usize = 16 * 1024 + 2048;

/// Whether the record layer is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    /// Plaintext in both directions.
    Off,
    /// Writes still go out as plaintext while incoming bytes are held back
    /// as ciphertext for the coming handshake.
    PreSsl,
    /// Records in both directions.
    Ssl,
}

/// Handler chain decorator that runs one TLS session.
pub(crate) struct SslHandler {
    successor: Box<dyn IoHandler>,
    engine: SslEngine,
    mode: SslMode,
    memory: Arc<SharedMemoryManager>,
    // Plaintext written while the handshake is running
    pending_plain: FrameQueue,
    // Ciphertext not yet fed to the engine
    in_net: FrameQueue,
    app_buffer_size: usize,
    net_buffer_size: usize,
    started: bool,
    handshake_done: bool,
}

// ============================================================================
// Constructors
// ============================================================================

impl SslHandler {
    pub(crate) fn new(
        successor: Box<dyn IoHandler>,
        engine: SslEngine,
        mode: SslMode,
        memory: Arc<SharedMemoryManager>,
    ) -> Self {
        Self {
            successor,
            engine,
            mode,
            memory,
            pending_plain: FrameQueue::new(),
            in_net: FrameQueue::new(),
            app_buffer_size: INITIAL_APP_BUFFER_SIZE,
            net_buffer_size: INITIAL_NET_BUFFER_SIZE,
            started: false,
            handshake_done: false,
        }
    }
}

// ============================================================================
// Secured Mode
// ============================================================================

impl SslHandler {
    pub(crate) fn mode(&self) -> SslMode {
        self.mode
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.mode == SslMode::Ssl && self.handshake_done
    }

    /// Switches OFF to PRE_SSL: incoming bytes are held back from now on.
    pub(crate) fn prepare_secured_mode(&mut self) {
        if self.mode == SslMode::Off {
            debug!(id = self.successor.id(), "Preparing secured mode");
            self.mode = SslMode::PreSsl;
        }
    }

    /// Activates the record layer mid-stream.
    ///
    /// `buffered` holds bytes that were received as plaintext but not yet
    /// consumed; they are the first ciphertext of the session and go ahead
    /// of anything held back during PRE_SSL.
    pub(crate) fn start_secured_mode(
        &mut self,
        buffered: Vec<Bytes>,
        callback: &mut dyn IoHandlerCallback,
    ) -> Result<(), Error> {
        if self.mode == SslMode::Ssl {
            return Ok(());
        }
        info!(id = self.successor.id(), buffered = buffered.len(), "Activating secured mode");
        self.in_net.add_first(buffered);
        self.mode = SslMode::Ssl;
        self.start()?;
        self.unwrap_pending(callback)
    }

    // Begins the handshake. A client sends its first record right away.
    fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        debug!(id = self.successor.id(), client = self.engine.is_client(), "Starting TLS handshake");
        if self.engine.is_client() {
            self.wrap_into_successor(&[])?;
        }
        Ok(())
    }
}

// ============================================================================
// Record Processing
// ============================================================================

impl SslHandler {
    // Feeds held-back ciphertext to the engine and delivers the plaintext.
    #[instrument(skip(self, callback), fields(id = self.successor.id()))]
    fn unwrap_pending(&mut self, callback: &mut dyn IoHandlerCallback) -> Result<(), Error> {
        let mut plain = Vec::new();
        let result = self.unwrap_into(&mut plain, callback);

        if !plain.is_empty() {
            trace!(segments = plain.len(), "Unwrapped application data");
            callback.on_data(plain);
        }
        result
    }

    fn unwrap_into(
        &mut self,
        plain: &mut Vec<Bytes>,
        callback: &mut dyn IoHandlerCallback,
    ) -> Result<(), Error> {
        while let Some(segment) = self.in_net.remove_first() {
            let mut offset = 0;
            let mut plaintext_left = false;

            while offset < segment.len() || plaintext_left {
                let mut dst = self.memory.acquire(self.app_buffer_size);
                let result = match self.engine.unwrap(&segment[offset..], &mut dst[..]) {
                    Ok(result) => result,
                    Err(err) => {
                        self.memory.recycle(dst);
                        return Err(err);
                    }
                };
                offset += result.consumed;

                if result.produced > 0 {
                    plain.push(self.memory.extract_and_recycle(dst, result.produced));
                } else {
                    self.memory.recycle(dst);
                }

                plaintext_left = result.status == EngineStatus::BufferOverflow;
                match result.status {
                    EngineStatus::BufferOverflow => {
                        self.app_buffer_size *= 2;
                        trace!(size = self.app_buffer_size, "Grew application buffer");
                        continue;
                    }
                    EngineStatus::Closed => {
                        debug!("Peer closed the TLS session");
                        return Err(Error::ConnectionClosed);
                    }
                    EngineStatus::BufferUnderflow | EngineStatus::Ok => {}
                }

                self.advance_handshake(callback)?;

                if result.consumed == 0 && result.produced == 0 {
                    // The engine takes no more input for now
                    self.in_net.add_first([segment.slice(offset..)]);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    // Reacts to the handshake state after an engine call.
    fn advance_handshake(&mut self, callback: &mut dyn IoHandlerCallback) -> Result<(), Error> {
        match self.engine.handshake_status() {
            HandshakeStatus::NeedWrap => self.wrap_into_successor(&[]),
            HandshakeStatus::Finished => {
                if self.engine.wants_write() {
                    self.wrap_into_successor(&[])?;
                }
                self.on_handshake_finished(callback)
            }
            HandshakeStatus::NeedUnwrap | HandshakeStatus::NotHandshaking => {
                // Alerts, session tickets and key updates
                if self.engine.wants_write() {
                    self.wrap_into_successor(&[])?;
                }
                Ok(())
            }
        }
    }

    fn on_handshake_finished(&mut self, callback: &mut dyn IoHandlerCallback) -> Result<(), Error> {
        self.handshake_done = true;
        info!(id = self.successor.id(), "TLS handshake complete");

        for segment in self.pending_plain.drain() {
            self.wrap_into_successor(&segment)?;
        }
        callback.on_connect();
        Ok(())
    }

    // Wraps `src` (or just pending handshake records when empty) and queues
    // the records on the successor.
    fn wrap_into_successor(&mut self, src: &[u8]) -> Result<(), Error> {
        let mut records = Vec::new();
        let mut offset = 0;

        let result = loop {
            let mut dst = self.memory.acquire(self.net_buffer_size);
            let result = match self.engine.wrap(&src[offset..], &mut dst[..]) {
                Ok(result) => result,
                Err(err) => {
                    self.memory.recycle(dst);
                    break Err(err);
                }
            };
            offset += result.consumed;

            if result.produced > 0 {
                records.push(self.memory.extract_and_recycle(dst, result.produced));
            } else {
                self.memory.recycle(dst);
            }

            match result.status {
                EngineStatus::BufferOverflow => {
                    if result.produced == 0 {
                        self.net_buffer_size *= 2;
                        trace!(size = self.net_buffer_size, "Grew network buffer");
                    }
                    continue;
                }
                EngineStatus::Closed => break Err(Error::ConnectionClosed),
                EngineStatus::Ok | EngineStatus::BufferUnderflow => {}
            }

            let no_progress = result.consumed == 0 && result.produced == 0;
            if offset >= src.len() || no_progress {
                break Ok(());
            }
        };

        if !records.is_empty() {
            self.successor.write(records)?;
        }
        result
    }
}

// ============================================================================
// IoHandler Trait Implementation
// ============================================================================

impl IoHandler for SslHandler {
    fn id(&self) -> usize {
        self.successor.id()
    }

    fn register(&mut self, registry: &Registry) -> Result<(), Error> {
        self.successor.register(registry)
    }

    fn deregister(&mut self, registry: &Registry) {
        self.successor.deregister(registry);
    }

    fn on_registered(&mut self, callback: &mut dyn IoHandlerCallback) -> Result<(), Error> {
        let mut socket_events = ChainEvents::default();
        self.successor.on_registered(&mut socket_events)?;

        match self.mode {
            // Connect is reported once the handshake completes
            SslMode::Ssl => self.start(),
            SslMode::Off | SslMode::PreSsl => {
                if socket_events.connected {
                    callback.on_connect();
                }
                Ok(())
            }
        }
    }

    fn on_readable(
        &mut self,
        memory: &dyn MemoryManager,
        callback: &mut dyn IoHandlerCallback,
    ) -> Result<(), Error> {
        let mut socket_events = ChainEvents::default();
        let read_result = self.successor.on_readable(memory, &mut socket_events);

        match self.mode {
            SslMode::Off => {
                if !socket_events.data.is_empty() {
                    callback.on_data(socket_events.data);
                }
            }
            SslMode::PreSsl => {
                trace!(segments = socket_events.data.len(), "Holding back ciphertext");
                self.in_net.append_all(socket_events.data);
            }
            SslMode::Ssl => {
                self.in_net.append_all(socket_events.data);
                self.unwrap_pending(callback)?;
            }
        }

        read_result
    }

    fn on_writable(&mut self, registry: &Registry) -> Result<WriteOutcome, Error> {
        self.successor.on_writable(registry)
    }

    fn on_disconnect(&mut self) {
        self.pending_plain.drain();
        self.in_net.drain();
        self.successor.on_disconnect();
    }

    fn write(&mut self, data: Vec<Bytes>) -> Result<(), Error> {
        match self.mode {
            SslMode::Off | SslMode::PreSsl => self.successor.write(data),
            SslMode::Ssl if !self.handshake_done => {
                if self.engine.is_outbound_closed() {
                    return Err(Error::ConnectionClosed);
                }
                self.pending_plain.append_all(data);
                Ok(())
            }
            SslMode::Ssl => {
                for segment in data {
                    self.wrap_into_successor(&segment)?;
                }
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.successor.flush()
    }

    fn close(&mut self, immediate: bool) -> Result<(), Error> {
        if self.mode == SslMode::Ssl && !immediate && !self.engine.is_outbound_closed() {
            self.engine.close_outbound();
            if let Err(err) = self.wrap_into_successor(&[]) {
                debug!(id = self.successor.id(), ?err, "Could not queue close_notify");
            }
        }
        self.successor.close(immediate)
    }

    fn pending_write_size(&self) -> usize {
        self.successor.pending_write_size()
    }

    fn ssl_handler(&mut self) -> Option<&mut SslHandler> {
        Some(self)
    }
}
