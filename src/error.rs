use thiserror::Error;

/// The error type for nbconn operations.
///
/// Covers socket I/O, connection state, framing, TLS and configuration
/// failures.
///
/// Running short of buffered data is not an error: framing reads report it
/// as `Ok(None)` and the caller retries after the next data notification. Faults
/// detected on a reactor thread never surface here; they close the affected
/// connection and are reported through `on_disconnect`.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    // ============================================================================
    // Connection State Errors
    // ============================================================================

    /// The connection is closed, either by the peer (EOF), by an explicit
    /// close, or because the TLS engine reported the session as closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The dispatcher a request was addressed to has already stopped.
    #[error("Dispatcher is closed")]
    DispatcherClosed,

    /// A blocking read saw no complete frame within its deadline.
    #[error("No data within {0:?}")]
    Timeout(std::time::Duration),

    // ============================================================================
    // Framing Errors
    // ============================================================================

    /// The delimiter was not found within the caller's byte budget.
    ///
    /// The connection stays open; the unread bytes remain queued.
    #[error("Max read size {max} exceeded before the delimiter was found")]
    MaxReadSizeExceeded {
        /// The byte budget that was exceeded.
        max: usize,
    },

    /// A delimiter read was requested with an empty delimiter.
    #[error("Delimiter must not be empty")]
    EmptyDelimiter,

    /// Bytes read as a string weren't valid UTF-8.
    #[error("Invalid UTF-8 data: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// The TLS handshake or record layer hit a protocol violation.
    ///
    /// Always fatal: the connection is closed and not retried.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Attempted to accept TLS connections but server configuration is missing.
    ///
    /// Provide the `tls_server_cert` and `tls_server_key` configuration keys.
    #[error("TLS server configuration not provided")]
    TlsServerConfigMissing,

    /// Attempted to open a TLS client connection but configuration is missing.
    ///
    /// Provide the `tls_ca_cert` configuration key.
    #[error("TLS client configuration not provided")]
    TlsClientConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    /// Secured mode was requested on a connection without a TLS layer.
    #[error("Connection {id} has no TLS layer")]
    SecuredModeUnavailable {
        /// The connection ID.
        id: usize,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for the `tls_start` configuration key.
    #[error("Invalid TLS start mode '{got}', expected one of: {}", .valid.join(", "))]
    InvalidTlsStartMode { got: String, valid: Vec<String> },

    // ============================================================================
    // Application Errors
    // ============================================================================

    /// An application callback failed. The connection is closed.
    #[error("Handler error: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an application error so a callback can return it.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Handler(err.into())
    }
}
