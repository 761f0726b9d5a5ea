use super::Connection;
use crate::error::Error;
use std::fmt;
use std::sync::Arc;

/// Application callbacks of a connection.
///
/// Every callback returns whether it handled the event. Only the timeout
/// callbacks act on the answer: an unhandled timeout closes the connection.
/// An `Err` (or a panic) from any callback is logged and closes the
/// connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Where the callbacks run. Read once per connection.
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::MultiThreaded
    }

    /// The connection is established (for TLS: the handshake completed).
    fn on_connect(&self, _connection: &Connection) -> Result<bool, Error> {
        Ok(false)
    }

    /// Data is available in the receive queue.
    ///
    /// Called again as long as data remains and the previous call consumed
    /// something.
    fn on_data(&self, _connection: &Connection) -> Result<bool, Error> {
        Ok(false)
    }

    /// Called once after the connection closed, if `on_connect` was reported.
    fn on_disconnect(&self, _connection: &Connection) -> Result<bool, Error> {
        Ok(false)
    }

    fn on_idle_timeout(&self, _connection: &Connection) -> Result<bool, Error> {
        Ok(false)
    }

    fn on_connection_timeout(&self, _connection: &Connection) -> Result<bool, Error> {
        Ok(false)
    }
}

/// Per-callback choice between the worker pool (`true`) and inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackModes {
    pub connect: bool,
    pub data: bool,
    pub disconnect: bool,
    pub timeout: bool,
}

/// Where a handler's callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerDescriptor {
    /// Inline on the reactor (or watchdog) thread. Callbacks must not block.
    NonThreaded,
    /// On the worker pool, one callback at a time per connection.
    MultiThreaded,
    Mixed(CallbackModes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Callback {
    Connect,
    Data,
    Disconnect,
    Timeout,
}

impl HandlerDescriptor {
    pub(crate) fn threaded(&self, callback: Callback) -> bool {
        match self {
            HandlerDescriptor::NonThreaded => false,
            HandlerDescriptor::MultiThreaded => true,
            HandlerDescriptor::Mixed(modes) => match callback {
                Callback::Connect => modes.connect,
                Callback::Data => modes.data,
                Callback::Disconnect => modes.disconnect,
                Callback::Timeout => modes.timeout,
            },
        }
    }
}

/// Produces the handler of each new connection.
#[derive(Clone)]
pub enum HandlerPrototype {
    /// One handler instance serves every connection.
    Shared(Arc<dyn ConnectionHandler>),
    /// A fresh handler per connection.
    PerConnection(Arc<dyn Fn() -> Arc<dyn ConnectionHandler> + Send + Sync>),
}

impl HandlerPrototype {
    pub fn shared<H: ConnectionHandler>(handler: H) -> Self {
        HandlerPrototype::Shared(Arc::new(handler))
    }

    pub fn per_connection<F, H>(factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: ConnectionHandler,
    {
        HandlerPrototype::PerConnection(Arc::new(move || {
            Arc::new(factory()) as Arc<dyn ConnectionHandler>
        }))
    }

    pub(crate) fn instantiate(&self) -> Arc<dyn ConnectionHandler> {
        match self {
            HandlerPrototype::Shared(handler) => handler.clone(),
            HandlerPrototype::PerConnection(factory) => factory(),
        }
    }
}

impl fmt::Debug for HandlerPrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerPrototype::Shared(_) => f.write_str("HandlerPrototype::Shared"),
            HandlerPrototype::PerConnection(_) => f.write_str("HandlerPrototype::PerConnection"),
        }
    }
}
