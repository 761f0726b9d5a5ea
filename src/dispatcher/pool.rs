use super::{Dispatcher, DispatcherSettings};
use crate::connection::Connection;
use crate::error::Error;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Observer of pool membership changes.
pub trait DispatcherPoolListener: Send + Sync {
    fn on_dispatcher_added(&self, _dispatcher: &Dispatcher) {}
    fn on_dispatcher_removed(&self, _dispatcher: &Dispatcher) {}
}

/// A resizable set of dispatcher threads with round-robin assignment.
///
/// Resizing never moves connections: a dispatcher removed from the pool
/// keeps serving the connections it already has and exits after the last
/// one closes.
pub struct DispatcherPool {
    name: String,
    settings: DispatcherSettings,
    active: RwLock<Vec<Arc<Dispatcher>>>,
    retired: Mutex<Vec<Arc<Dispatcher>>>,
    pointer: AtomicUsize,
    next_index: AtomicUsize,
    listeners: RwLock<Vec<Arc<dyn DispatcherPoolListener>>>,
    closed: AtomicBool,
}

// ============================================================================
// Constructors
// ============================================================================

impl DispatcherPool {
    pub(crate) fn new(name: &str, size: usize, settings: DispatcherSettings) -> Result<Self, Error> {
        let name = if name.is_empty() { "dispatcher" } else { name };
        let pool = Self {
            name: name.to_string(),
            settings,
            active: RwLock::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            pointer: AtomicUsize::new(0),
            next_index: AtomicUsize::new(0),
            listeners: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        pool.set_size(size)?;
        Ok(pool)
    }
}

// ============================================================================
// Public API
// ============================================================================

impl DispatcherPool {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of active dispatchers.
    pub fn size(&self) -> usize {
        self.active
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Starts or retires dispatchers until `size` are active.
    ///
    /// New dispatchers are appended; excess ones are retired from the end.
    pub fn set_size(&self, size: usize) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DispatcherClosed);
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();
        {
            let mut active = self
                .active
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            while active.len() < size {
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                let dispatcher =
                    Dispatcher::start(format!("{}#{}", self.name, index), self.settings)?;
                info!(name = dispatcher.name(), "Dispatcher added");
                active.push(dispatcher.clone());
                added.push(dispatcher);
            }

            while active.len() > size {
                if let Some(dispatcher) = active.pop() {
                    dispatcher.retire();
                    info!(name = dispatcher.name(), "Dispatcher removed");
                    removed.push(dispatcher);
                }
            }
        }

        if !removed.is_empty() {
            let mut retired = crate::lock(&self.retired);
            retired.retain(|dispatcher| dispatcher.is_running());
            retired.extend(removed.iter().cloned());
        }

        let listeners = self.listeners();
        for dispatcher in &added {
            for listener in &listeners {
                listener.on_dispatcher_added(dispatcher);
            }
        }
        for dispatcher in &removed {
            for listener in &listeners {
                listener.on_dispatcher_removed(dispatcher);
            }
        }
        Ok(())
    }

    /// Active dispatchers in assignment order.
    pub fn dispatchers(&self) -> Vec<Arc<Dispatcher>> {
        self.active
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Picks the dispatcher for the next connection. The pointer wraps at the
    /// pool size.
    pub fn next_dispatcher(&self) -> Result<Arc<Dispatcher>, Error> {
        let active = self
            .active
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if active.is_empty() {
            return Err(Error::DispatcherClosed);
        }
        let index = self.pointer.fetch_add(1, Ordering::Relaxed) % active.len();
        Ok(active[index].clone())
    }

    /// Open connections over active and retiring dispatchers.
    pub fn open_connections(&self) -> usize {
        self.all_dispatchers()
            .iter()
            .map(|dispatcher| dispatcher.open_connections())
            .sum()
    }

    /// Snapshot of every registered connection, asked of each dispatcher.
    ///
    /// From an inline callback the calling reactor's own connections are
    /// left out; see [`Dispatcher::registered()`].
    pub fn registered_connections(&self) -> Vec<Connection> {
        self.all_dispatchers()
            .iter()
            .flat_map(|dispatcher| dispatcher.registered())
            .collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn DispatcherPoolListener>) {
        self.listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(listener);
    }

    /// Stops every dispatcher. Their connections are closed immediately.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let active: Vec<Arc<Dispatcher>> = std::mem::take(
            &mut *self
                .active
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        let retired: Vec<Arc<Dispatcher>> = std::mem::take(&mut *crate::lock(&self.retired));

        debug!(name = %self.name, active = active.len(), retired = retired.len(), "Closing dispatcher pool");
        for dispatcher in active.iter().chain(retired.iter()) {
            dispatcher.shutdown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Internals
// ============================================================================

impl DispatcherPool {
    fn all_dispatchers(&self) -> Vec<Arc<Dispatcher>> {
        let mut all = self.dispatchers();
        all.extend(crate::lock(&self.retired).iter().cloned());
        all
    }

    fn listeners(&self) -> Vec<Arc<dyn DispatcherPoolListener>> {
        self.listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Drop for DispatcherPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DispatcherPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherPool")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}
