//! Plain socket handler, the bottom of every handler chain.

use super::{IoHandler, IoHandlerCallback, IoStats, WriteOutcome};
use crate::dispatcher::{DispatcherInterface, DispatcherRequest};
use crate::error::Error;
use crate::memory::MemoryManager;
use crate::queue::FrameQueue;

use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{ErrorKind, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, instrument, trace, warn};

/// Owns one non-blocking socket and its send queue.
pub(crate) struct SocketIoHandler {
    id: usize,
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    interest: Interest,
    registered: bool,
    os_open: bool,
    logical_closed: bool,
    send_queue: FrameQueue,
    dispatcher: DispatcherInterface,
    stats: Arc<IoStats>,
}

// ============================================================================
// Constructors
// ============================================================================

impl SocketIoHandler {
    pub(crate) fn new(
        id: usize,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        dispatcher: DispatcherInterface,
        stats: Arc<IoStats>,
    ) -> Self {
        Self {
            id,
            stream,
            local_addr,
            peer_addr,
            interest: Interest::READABLE,
            registered: false,
            os_open: true,
            logical_closed: false,
            send_queue: FrameQueue::new(),
            dispatcher,
            stats,
        }
    }
}

// ============================================================================
// Internal Socket I/O
// ============================================================================

impl SocketIoHandler {
    // Reads until the socket would block. mio readiness is edge-triggered,
    // so stopping earlier could strand bytes until the peer sends more.
    #[instrument(skip(self, memory, callback), fields(id = self.id))]
    fn read_socket(
        &mut self,
        memory: &dyn MemoryManager,
        callback: &mut dyn IoHandlerCallback,
    ) -> Result<(), Error> {
        let local_addr = &self.local_addr;
        let peer_addr = &self.peer_addr;
        let mut received = Vec::new();
        let mut received_len = 0;
        let mut result = Ok(());

        loop {
            let mut buffer = memory.acquire(1);
            match self.stream.read(&mut buffer[..]) {
                Ok(0) => {
                    memory.recycle(buffer);
                    debug!(%local_addr, %peer_addr, "Peer closed connection");
                    result = Err(Error::ConnectionClosed);
                    break;
                }
                Ok(len) => {
                    trace!(len, %local_addr, %peer_addr, "Read data from socket");
                    received_len += len;
                    received.push(memory.extract_and_recycle(buffer, len));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    memory.recycle(buffer);
                    break;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {
                    memory.recycle(buffer);
                    continue;
                }
                Err(err) => {
                    memory.recycle(buffer);
                    if err.kind() == ErrorKind::BrokenPipe {
                        warn!(%local_addr, %peer_addr, "Broken pipe");
                    } else if err.kind() == ErrorKind::ConnectionReset {
                        warn!(%local_addr, %peer_addr, "Connection reset");
                    } else {
                        error!(%local_addr, %peer_addr, ?err, "Error reading from socket");
                    }
                    result = Err(err.into());
                    break;
                }
            }
        }

        // Bytes read before EOF or an error are still delivered
        if !received.is_empty() {
            debug!(len = received_len, %local_addr, %peer_addr, "Received data");
            self.stats.record_received(received_len);
            callback.on_data(received);
        }

        result
    }

    // Writes the send queue until it is empty or the socket would block.
    // Partially written segments go back to the head of the queue.
    #[instrument(skip(self), fields(id = self.id))]
    fn write_socket(&mut self) -> Result<(), Error> {
        let local_addr = &self.local_addr;
        let peer_addr = &self.peer_addr;

        while !self.send_queue.is_empty() {
            let segments = self.send_queue.drain();
            let slices: Vec<IoSlice<'_>> = segments.iter().map(|s| IoSlice::new(s)).collect();

            match self.stream.write_vectored(&slices) {
                Ok(0) => {
                    warn!(remaining = self.send_queue.len(), %local_addr, %peer_addr, "Write to socket returned 0");
                    self.send_queue.add_first(segments);
                    break;
                }
                Ok(written) => {
                    self.stats.record_sent(written);
                    let unwritten = unwritten_segments(segments, written);
                    self.send_queue.add_first(unwritten);
                    trace!(len = written, remaining = self.send_queue.len(), %local_addr, %peer_addr, "Wrote to socket");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.send_queue.add_first(segments);
                    break;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {
                    self.send_queue.add_first(segments);
                }
                Err(err) => {
                    if err.kind() == ErrorKind::BrokenPipe {
                        warn!(%local_addr, %peer_addr, "Broken pipe");
                    } else if err.kind() == ErrorKind::ConnectionReset {
                        warn!(%local_addr, %peer_addr, "Connection reset");
                    } else {
                        error!(%local_addr, %peer_addr, ?err, "Error writing to socket");
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(())
    }

    fn update_interest(&mut self, registry: &Registry, interest: Interest) -> Result<(), Error> {
        if self.registered && self.interest != interest {
            registry.reregister(&mut self.stream, Token(self.id), interest)?;
            self.interest = interest;
        }
        Ok(())
    }
}

// Drops the first `written` bytes from `segments`.
fn unwritten_segments(segments: Vec<Bytes>, mut written: usize) -> Vec<Bytes> {
    let mut unwritten = Vec::new();
    for mut segment in segments {
        if written >= segment.len() {
            written -= segment.len();
        } else {
            segment.advance(written);
            written = 0;
            unwritten.push(segment);
        }
    }
    unwritten
}

// ============================================================================
// IoHandler Trait Implementation
// ============================================================================

impl IoHandler for SocketIoHandler {
    fn id(&self) -> usize {
        self.id
    }

    fn register(&mut self, registry: &Registry) -> Result<(), Error> {
        registry.register(&mut self.stream, Token(self.id), Interest::READABLE)?;
        self.registered = true;
        self.interest = Interest::READABLE;
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) {
        if self.registered {
            if let Err(err) = registry.deregister(&mut self.stream) {
                warn!(id = self.id, ?err, "Failed to deregister connection");
            }
            self.registered = false;
        }
        if self.os_open {
            // The peer may already be gone
            let _ = self.stream.shutdown(Shutdown::Both);
            self.os_open = false;
        }
    }

    fn on_registered(&mut self, callback: &mut dyn IoHandlerCallback) -> Result<(), Error> {
        callback.on_connect();
        Ok(())
    }

    fn on_readable(
        &mut self,
        memory: &dyn MemoryManager,
        callback: &mut dyn IoHandlerCallback,
    ) -> Result<(), Error> {
        if !self.os_open {
            return Err(Error::ConnectionClosed);
        }
        self.read_socket(memory, callback)
    }

    fn on_writable(&mut self, registry: &Registry) -> Result<WriteOutcome, Error> {
        if !self.os_open {
            return Err(Error::ConnectionClosed);
        }
        self.write_socket()?;

        if self.send_queue.is_empty() {
            self.update_interest(registry, Interest::READABLE)?;
            if self.logical_closed {
                Ok(WriteOutcome::CloseNow)
            } else {
                Ok(WriteOutcome::Drained)
            }
        } else {
            self.update_interest(registry, Interest::READABLE | Interest::WRITABLE)?;
            Ok(WriteOutcome::Pending)
        }
    }

    fn on_disconnect(&mut self) {
        let dropped = self.send_queue.drain();
        if !dropped.is_empty() {
            let len: usize = dropped.iter().map(Bytes::len).sum();
            debug!(id = self.id, len, "Discarded unsent data");
        }
    }

    fn write(&mut self, data: Vec<Bytes>) -> Result<(), Error> {
        if !self.os_open || self.logical_closed {
            return Err(Error::ConnectionClosed);
        }
        self.send_queue.append_all(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.send_queue.is_empty() {
            return Ok(());
        }
        self.dispatcher
            .request(DispatcherRequest::Flush { id: self.id })
    }

    fn close(&mut self, immediate: bool) -> Result<(), Error> {
        self.logical_closed = true;
        self.dispatcher.request(DispatcherRequest::Close {
            id: self.id,
            immediate,
        })
    }

    fn pending_write_size(&self) -> usize {
        self.send_queue.len()
    }
}
