//! A buffer-to-buffer TLS engine on top of rustls.
//!
//! [`SslEngine`] never touches a socket. `unwrap` turns ciphertext into
//! plaintext and `wrap` turns plaintext into ciphertext, each reporting what
//! it consumed, what it produced and why it stopped.

use crate::error::Error;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

// Internal enum for TLS connection type
enum TlsConnection {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, src: &mut &[u8]) -> Result<usize, std::io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.read_tls(src),
            TlsConnection::Client(conn) => conn.read_tls(src),
        }
    }

    fn write_tls(&mut self, dst: &mut &mut [u8]) -> Result<usize, std::io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.write_tls(dst),
            TlsConnection::Client(conn) => conn.write_tls(dst),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnection::Server(conn) => conn.process_new_packets(),
            TlsConnection::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.wants_write(),
            TlsConnection::Client(conn) => conn.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnection::Server(conn) => conn.writer(),
            TlsConnection::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnection::Server(conn) => conn.reader(),
            TlsConnection::Client(conn) => conn.reader(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.is_handshaking(),
            TlsConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Server(conn) => conn.send_close_notify(),
            TlsConnection::Client(conn) => conn.send_close_notify(),
        }
    }
}

/// Why a `wrap` or `unwrap` call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// All input was taken but it did not complete a record. Not an error;
    /// call again once more ciphertext has arrived.
    BufferUnderflow,
    /// The output buffer filled up before all output was produced. Retry
    /// with a larger buffer (or a fresh one) and the unconsumed input.
    BufferOverflow,
    /// The session is closed in the direction of the call.
    Closed,
}

/// Where the handshake stands after a call.
///
/// rustls performs all handshake work inline, so there is no state asking
/// the caller to run delegated tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// The engine has handshake records to send.
    NeedWrap,
    /// The engine waits for handshake records from the peer.
    NeedUnwrap,
    /// The handshake just completed. Reported exactly once.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub consumed: usize,
    pub produced: usize,
}

/// One TLS session, either side.
pub struct SslEngine {
    conn: TlsConnection,
    finished_reported: bool,
    outbound_closed: bool,
    inbound_closed: bool,
}

// ============================================================================
// Constructors
// ============================================================================

impl SslEngine {
    /// Creates the server side of a session.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, Error> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
        Ok(Self::with_connection(TlsConnection::Server(conn)))
    }

    /// Creates the client side of a session. `server_name` is used for SNI
    /// and certificate verification.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::TlsInvalidServerName(server_name.to_string()))?;
        let conn = rustls::ClientConnection::new(config, name)
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;
        Ok(Self::with_connection(TlsConnection::Client(conn)))
    }

    fn with_connection(conn: TlsConnection) -> Self {
        Self {
            conn,
            finished_reported: false,
            outbound_closed: false,
            inbound_closed: false,
        }
    }
}

// ============================================================================
// Record Layer
// ============================================================================

impl SslEngine {
    /// Decrypts as much of `src` as possible into `dst`.
    ///
    /// Handshake records in `src` advance the handshake; check
    /// [`handshake_status()`](Self::handshake_status) afterwards. A protocol
    /// violation fails with [`Error::TlsHandshake`].
    pub fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error> {
        let mut consumed = 0;
        let mut produced = 0;

        loop {
            // Plaintext left over from an earlier call goes out first
            produced += self.read_plaintext(&mut dst[produced..])?;

            if consumed == src.len() {
                break;
            }

            let mut input = &src[consumed..];
            let read = match self.conn.read_tls(&mut input) {
                Ok(read) => read,
                // rustls holds too much unread plaintext; the caller has to
                // make room first
                Err(err) if err.kind() == ErrorKind::Other => break,
                Err(err) => return Err(err.into()),
            };
            if read == 0 {
                break;
            }
            consumed += read;

            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| Error::TlsHandshake(e.to_string()))?;
            if state.peer_has_closed() {
                self.inbound_closed = true;
            }

            if produced == dst.len() && state.plaintext_bytes_to_read() > 0 {
                break;
            }
        }

        // Anything still readable after filling `dst`
        let pending_plaintext = if produced == dst.len() {
            self.conn
                .process_new_packets()
                .map_err(|e| Error::TlsHandshake(e.to_string()))?
                .plaintext_bytes_to_read()
        } else {
            0
        };

        let status = if pending_plaintext > 0 {
            EngineStatus::BufferOverflow
        } else if self.inbound_closed {
            EngineStatus::Closed
        } else if produced == 0 && consumed == src.len() {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };

        Ok(EngineResult {
            status,
            consumed,
            produced,
        })
    }

    /// Encrypts `src` and writes pending records into `dst`.
    ///
    /// Plaintext is only taken once the handshake has finished; while it is
    /// in progress a call with an empty `src` just emits handshake records.
    pub fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error> {
        if self.outbound_closed && !src.is_empty() {
            return Ok(EngineResult {
                status: EngineStatus::Closed,
                consumed: 0,
                produced: 0,
            });
        }

        let consumed = if src.is_empty() || self.conn.is_handshaking() {
            0
        } else {
            self.conn.writer().write(src)?
        };

        let mut produced = 0;
        while self.conn.wants_write() && produced < dst.len() {
            let mut output = &mut dst[produced..];
            let written = self.conn.write_tls(&mut output)?;
            if written == 0 {
                break;
            }
            produced += written;
        }

        let status = if self.conn.wants_write() {
            EngineStatus::BufferOverflow
        } else {
            EngineStatus::Ok
        };

        Ok(EngineResult {
            status,
            consumed,
            produced,
        })
    }

    fn read_plaintext(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        let mut produced = 0;
        while produced < dst.len() {
            match self.conn.reader().read(&mut dst[produced..]) {
                // Clean close_notify from the peer
                Ok(0) => {
                    self.inbound_closed = true;
                    break;
                }
                Ok(len) => produced += len,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    self.inbound_closed = true;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(produced)
    }
}

// ============================================================================
// Session State
// ============================================================================

impl SslEngine {
    pub fn handshake_status(&mut self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if !self.finished_reported {
            self.finished_reported = true;
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Whether records are waiting for a `wrap` call.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    pub fn is_client(&self) -> bool {
        matches!(self.conn, TlsConnection::Client(_))
    }

    /// Queues a `close_notify` alert. Later `wrap` calls refuse plaintext.
    pub fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.conn.send_close_notify();
            self.outbound_closed = true;
        }
    }

    pub fn is_outbound_closed(&self) -> bool {
        self.outbound_closed
    }

    pub fn is_inbound_closed(&self) -> bool {
        self.inbound_closed
    }
}

impl std::fmt::Debug for SslEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SslEngine")
            .field("client", &self.is_client())
            .field("handshaking", &self.is_handshaking())
            .field("outbound_closed", &self.outbound_closed)
            .field("inbound_closed", &self.inbound_closed)
            .finish()
    }
}
