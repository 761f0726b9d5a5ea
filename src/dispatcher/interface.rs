use crate::connection::{Connection, ConnectionInner};
use crate::error::Error;
use mio::Waker;
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;

// Requests handed to a dispatcher thread from other threads
pub(crate) enum DispatcherRequest {
    // Connection Management
    Register {
        connection: Arc<ConnectionInner>,
    },
    Flush {
        id: usize,
    },
    Close {
        id: usize,
        immediate: bool,
    },
    Registered {
        response: Sender<Vec<Connection>>,
    },

    // Lifecycle
    Retire,
    Shutdown,
}

impl fmt::Debug for DispatcherRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { connection } => f
                .debug_struct("Register")
                .field("id", &connection.id())
                .finish(),
            Self::Flush { id } => f.debug_struct("Flush").field("id", id).finish(),
            Self::Close { id, immediate } => f
                .debug_struct("Close")
                .field("id", id)
                .field("immediate", immediate)
                .finish(),
            Self::Registered { .. } => f.write_str("Registered"),
            Self::Retire => f.write_str("Retire"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Thread-safe handle for submitting requests to one dispatcher thread.
///
/// Every request is queued on a channel and the reactor is woken to pick
/// it up. Clones share the same dispatcher.
#[derive(Clone)]
pub(crate) struct DispatcherInterface {
    pub(crate) sender: Sender<DispatcherRequest>,
    pub(crate) waker: Arc<Waker>,
}

impl DispatcherInterface {
    pub(crate) fn request(&self, request: DispatcherRequest) -> Result<(), Error> {
        self.sender
            .send(request)
            .map_err(|_| Error::DispatcherClosed)?;
        self.waker.wake().map_err(|_| Error::DispatcherClosed)
    }
}

impl fmt::Debug for DispatcherInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherInterface").finish_non_exhaustive()
    }
}
