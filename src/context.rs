//! The explicit runtime context.
//!
//! An [`IoContext`] owns everything connections share: the dispatcher pool,
//! the callback executor, the TLS buffer pool, the timeout watchdog and the
//! connection id allocator. It is constructed once and passed to acceptors;
//! clones share the same runtime.

use crate::config::Settings;
use crate::connection::{Connection, ConnectionInner, HandlerPrototype, NewConnection};
use crate::dispatcher::{DispatcherPool, DispatcherSettings};
use crate::error::Error;
use crate::handler::{IoHandler, IoStats, SocketIoHandler};
use crate::memory::SharedMemoryManager;
#[cfg(feature = "tls")]
use crate::ssl::{tls_config::TlsConfigs, SslEngine, SslHandler, SslMode};
use crate::watchdog::Watchdog;
use crate::worker::{Executor, WorkerPool};
#[cfg(feature = "tls")]
use crate::TlsStart;

use ::config::Config;
use mio::net::TcpStream;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, instrument};

const CONNECTION_ID_RANGE_START: usize = 1000;

// Which end of the TLS session a new connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Server,
    Client,
}

struct ContextInner {
    settings: Settings,
    pool: Arc<DispatcherPool>,
    executor: Arc<dyn Executor>,
    // Set when the context created its own workers
    worker_pool: Option<Arc<WorkerPool>>,
    ssl_memory: Arc<SharedMemoryManager>,
    watchdog: Arc<Watchdog>,
    next_id: AtomicUsize,
    #[cfg(feature = "tls")]
    tls: TlsConfigs,
}

/// Shared runtime of a set of connections.
#[derive(Clone)]
pub struct IoContext {
    inner: Arc<ContextInner>,
}

// ============================================================================
// Constructors
// ============================================================================

impl IoContext {
    /// Builds a context from un-namespaced configuration keys.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::from_settings(Settings::from_config(config)?)
    }

    /// Builds a context from keys under the `name.` namespace.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        Self::from_settings(Settings::from_config_named(config, name)?)
    }

    /// Builds a context with its own worker pool of
    /// `settings.worker_pool_size` threads.
    pub fn from_settings(settings: Settings) -> Result<Self, Error> {
        let workers = Arc::new(WorkerPool::new(&settings.name, settings.worker_pool_size)?);
        Self::build(settings, workers.clone(), Some(workers))
    }

    /// Builds a context whose threaded callbacks run on `executor`.
    pub fn with_executor(settings: Settings, executor: Arc<dyn Executor>) -> Result<Self, Error> {
        Self::build(settings, executor, None)
    }

    fn build(
        settings: Settings,
        executor: Arc<dyn Executor>,
        worker_pool: Option<Arc<WorkerPool>>,
    ) -> Result<Self, Error> {
        #[cfg(feature = "tls")]
        let tls = TlsConfigs::load(&settings)?;

        let pool = Arc::new(DispatcherPool::new(
            &settings.name,
            settings.dispatcher_pool_size,
            DispatcherSettings {
                poll_capacity: settings.poll_capacity,
                read_buffer_preallocation_size: settings.read_buffer_preallocation_size,
                read_buffer_min_size: settings.read_buffer_min_size,
            },
        )?);
        let watchdog = Watchdog::start(&settings.name, Arc::downgrade(&pool))?;
        let ssl_memory = Arc::new(SharedMemoryManager::new(
            settings.read_buffer_preallocation_size,
            settings.read_buffer_min_size,
        ));

        info!(
            name = %settings.name,
            dispatchers = settings.dispatcher_pool_size,
            workers = settings.worker_pool_size,
            "Context started"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                settings,
                pool,
                executor,
                worker_pool,
                ssl_memory,
                watchdog,
                next_id: AtomicUsize::new(CONNECTION_ID_RANGE_START),
                #[cfg(feature = "tls")]
                tls,
            }),
        })
    }
}

// ============================================================================
// Public API
// ============================================================================

impl IoContext {
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn pool(&self) -> &DispatcherPool {
        &self.inner.pool
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        self.inner.executor.clone()
    }

    /// Buffer pool of the TLS record layer.
    pub fn ssl_memory(&self) -> &SharedMemoryManager {
        &self.inner.ssl_memory
    }

    /// Idle timeouts fired so far, over all connections.
    pub fn idle_timeout_count(&self) -> usize {
        self.inner.watchdog.idle_timeouts()
    }

    pub fn connection_timeout_count(&self) -> usize {
        self.inner.watchdog.connection_timeouts()
    }

    /// Opens an outbound connection.
    ///
    /// The TCP connect itself blocks. With `tls_ca_cert` configured the
    /// connection is the client end of a TLS session; with
    /// `tls_start = "eager"` the handshake starts right away and
    /// `on_connect` fires when it completes. With `tls_start` set but no
    /// `tls_ca_cert`, fails with [`Error::TlsClientConfigMissing`].
    #[instrument(skip(self, addr, prototype))]
    pub fn connect<A: ToSocketAddrs>(
        &self,
        addr: A,
        prototype: &HandlerPrototype,
    ) -> Result<Connection, Error> {
        let peer_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let stream = std::net::TcpStream::connect(peer_addr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        self.open_connection(TcpStream::from_std(stream), peer_addr, prototype, Side::Client)
    }

    /// Stops the watchdog, the dispatchers (closing every connection) and
    /// the worker pool, if the context owns one.
    pub fn shutdown(&self) {
        info!(name = %self.inner.settings.name, "Context shutting down");
        self.inner.watchdog.shutdown();
        self.inner.pool.close();
        if let Some(workers) = &self.inner.worker_pool {
            workers.shutdown();
        }
    }
}

// ============================================================================
// Crate-internal API
// ============================================================================

impl IoContext {
    /// Wraps a connected socket into a connection and hands it to the next
    /// dispatcher.
    pub(crate) fn open_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        prototype: &HandlerPrototype,
        side: Side,
    ) -> Result<Connection, Error> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let local_addr = stream.local_addr()?;
        let dispatcher = self.inner.pool.next_dispatcher()?;
        let stats = Arc::new(IoStats::new());

        info!(id, %local_addr, %peer_addr, dispatcher = dispatcher.name(), ?side, "Opening connection");

        let socket = SocketIoHandler::new(
            id,
            stream,
            local_addr,
            peer_addr,
            dispatcher.interface(),
            stats.clone(),
        );
        let chain = self.build_chain(Box::new(socket), side)?;

        let inner = ConnectionInner::new(NewConnection {
            id,
            local_addr,
            peer_addr,
            chain,
            stats,
            handler: prototype.instantiate(),
            executor: self.inner.executor.clone(),
            watchdog: self.inner.watchdog.clone(),
            idle_timeout: self.inner.settings.idle_timeout,
            connection_timeout: self.inner.settings.connection_timeout,
        });

        dispatcher.register(inner.clone())?;
        Ok(Connection::from_inner(inner))
    }

    #[cfg(feature = "tls")]
    fn build_chain(
        &self,
        socket: Box<dyn IoHandler>,
        side: Side,
    ) -> Result<Box<dyn IoHandler>, Error> {
        let start = self.inner.settings.tls_start;
        let engine = match side {
            Side::Server => match (&self.inner.tls.server, start) {
                (Some(config), _) => SslEngine::server(config.clone())?,
                (None, None) => return Ok(socket),
                (None, Some(_)) => return Err(Error::TlsServerConfigMissing),
            },
            Side::Client => match (&self.inner.tls.client, start) {
                (Some(config), _) => {
                    let server_name = self
                        .inner
                        .settings
                        .tls_server_name
                        .as_deref()
                        .unwrap_or("localhost");
                    SslEngine::client(config.clone(), server_name)?
                }
                (None, None) => return Ok(socket),
                (None, Some(_)) => return Err(Error::TlsClientConfigMissing),
            },
        };

        let mode = match start.unwrap_or(TlsStart::Eager) {
            TlsStart::Eager => SslMode::Ssl,
            TlsStart::OnDemand => SslMode::Off,
        };
        tracing::debug!(?side, ?mode, "Adding TLS layer");

        Ok(Box::new(SslHandler::new(
            socket,
            engine,
            mode,
            self.inner.ssl_memory.clone(),
        )))
    }

    #[cfg(not(feature = "tls"))]
    fn build_chain(
        &self,
        socket: Box<dyn IoHandler>,
        _side: Side,
    ) -> Result<Box<dyn IoHandler>, Error> {
        Ok(socket)
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.watchdog.shutdown();
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("name", &self.inner.settings.name)
            .field("pool", &self.inner.pool)
            .finish()
    }
}
