//! nbconn - A non-blocking TCP connection framework
//!
//! An [`Acceptor`] accepts sockets and hands each one to a [`Dispatcher`]
//! picked round-robin from the [`DispatcherPool`]. Every dispatcher is a mio
//! reactor thread. Incoming bytes collect in a per-connection
//! [`FrameQueue`] that supports zero-copy length and delimiter framing, and
//! application callbacks run either inline or on a worker pool, one at a
//! time per connection.
//!
//! With the `tls` feature, a TLS record layer (rustls) can be layered onto a
//! connection from the start or activated mid-stream (STARTTLS style).
//!
//! Everything hangs off an explicit [`IoContext`]; there is no process-wide
//! state.

// Internal-only modules
pub(crate) mod acceptor;
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod context;
pub(crate) mod dispatcher;
pub(crate) mod error;
pub(crate) mod handler;
pub(crate) mod memory;
pub(crate) mod queue;
#[cfg(feature = "tls")]
pub(crate) mod ssl;
pub(crate) mod watchdog;
pub(crate) mod worker;

// These are the intended public API
pub use acceptor::{Acceptor, AcceptorHandle};
pub use config::{Settings, TlsStart};
pub use connection::{
    CallbackModes, Connection, ConnectionHandler, HandlerDescriptor, HandlerPrototype,
};
pub use context::IoContext;
pub use dispatcher::{Dispatcher, DispatcherPool, DispatcherPoolListener};
pub use error::Error;
pub use memory::{MemoryManager, SharedMemoryManager, UnsyncMemoryManager};
pub use queue::{ByteSink, FrameQueue, Index};
#[cfg(feature = "tls")]
pub use ssl::{EngineResult, EngineStatus, HandshakeStatus, SslEngine, SslMode};
pub use worker::{Executor, Task, WorkerPool};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::acceptor::{Acceptor, AcceptorHandle};
    pub use crate::connection::{
        CallbackModes, Connection, ConnectionHandler, HandlerDescriptor, HandlerPrototype,
    };
    pub use crate::context::IoContext;
    pub use crate::error::Error;
    pub use crate::queue::FrameQueue;
}

// Locks a mutex, ignoring poisoning. A panicking callback must not take the
// whole connection (or dispatcher) down with it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
