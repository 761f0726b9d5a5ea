//! The per-connection I/O handler chain.
//!
//! The bottom of every chain is a [`SocketIoHandler`] that owns the socket.
//! Decorators (the TLS layer) wrap a successor and forward whatever they
//! don't handle themselves. Upward notifications travel through an
//! [`IoHandlerCallback`] passed into each call rather than through stored
//! back-references.

pub(crate) mod socket;

pub(crate) use socket::SocketIoHandler;

use crate::error::Error;
use crate::memory::MemoryManager;
#[cfg(feature = "tls")]
use crate::ssl::SslHandler;
use bytes::Bytes;
use mio::Registry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Receives notifications from the handler below.
pub(crate) trait IoHandlerCallback {
    fn on_connect(&mut self);
    fn on_data(&mut self, data: Vec<Bytes>);
}

/// Collects what a chain call produced so it can be delivered after the
/// chain lock is released.
#[derive(Debug, Default)]
pub(crate) struct ChainEvents {
    pub(crate) connected: bool,
    pub(crate) data: Vec<Bytes>,
    // Data already moved into the receive queue
    pub(crate) received: bool,
}

impl IoHandlerCallback for ChainEvents {
    fn on_connect(&mut self) {
        self.connected = true;
    }

    fn on_data(&mut self, data: Vec<Bytes>) {
        self.data.extend(data);
    }
}

// Result of flushing the send queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Drained,
    Pending,
    // Queue drained and a graceful close was requested
    CloseNow,
}

/// A link in the handler chain.
///
/// Registration, readiness and close calls run on the owning dispatcher
/// thread. `write`, `flush` and `close` may be called from any thread
/// holding the chain lock.
pub(crate) trait IoHandler: Send {
    fn id(&self) -> usize;

    // ============================================================================
    // Reactor Side
    // ============================================================================

    fn register(&mut self, registry: &Registry) -> Result<(), Error>;

    /// Deregisters and shuts the socket down.
    fn deregister(&mut self, registry: &Registry);

    /// Called once after registration.
    fn on_registered(&mut self, callback: &mut dyn IoHandlerCallback) -> Result<(), Error>;

    fn on_readable(
        &mut self,
        memory: &dyn MemoryManager,
        callback: &mut dyn IoHandlerCallback,
    ) -> Result<(), Error>;

    fn on_writable(&mut self, registry: &Registry) -> Result<WriteOutcome, Error>;

    /// Releases per-connection state after the socket is closed.
    fn on_disconnect(&mut self);

    // ============================================================================
    // Application Side
    // ============================================================================

    /// Queues outgoing data. Nothing reaches the socket before `flush`.
    fn write(&mut self, data: Vec<Bytes>) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;

    /// Requests a close. A graceful close waits for the send queue to drain.
    fn close(&mut self, immediate: bool) -> Result<(), Error>;

    fn pending_write_size(&self) -> usize;

    #[cfg(feature = "tls")]
    fn ssl_handler(&mut self) -> Option<&mut SslHandler> {
        None
    }
}

// ============================================================================
// I/O Statistics
// ============================================================================

/// Byte counters and timestamps of one connection, readable without taking
/// the chain lock.
#[derive(Debug)]
pub(crate) struct IoStats {
    opened_at: Instant,
    received_bytes: AtomicU64,
    sent_bytes: AtomicU64,
    // Milliseconds since `opened_at`
    last_received: AtomicU64,
    last_sent: AtomicU64,
}

impl IoStats {
    pub(crate) fn new() -> Self {
        Self {
            opened_at: Instant::now(),
            received_bytes: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
            last_sent: AtomicU64::new(0),
        }
    }

    fn elapsed_millis(&self) -> u64 {
        self.opened_at.elapsed().as_millis() as u64
    }

    pub(crate) fn record_received(&self, len: usize) {
        self.received_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.last_received
            .store(self.elapsed_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, len: usize) {
        self.sent_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.last_sent.store(self.elapsed_millis(), Ordering::Relaxed);
    }

    pub(crate) fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub(crate) fn last_received_at(&self) -> Instant {
        self.opened_at + Duration::from_millis(self.last_received.load(Ordering::Relaxed))
    }

    pub(crate) fn last_sent_at(&self) -> Instant {
        self.opened_at + Duration::from_millis(self.last_sent.load(Ordering::Relaxed))
    }

    /// Time since the last received byte, or since open if nothing arrived.
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_received_at())
    }

    pub(crate) fn open_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.opened_at)
    }
}
