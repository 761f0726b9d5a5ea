//! Idle and connection timeout checks.
//!
//! One thread per context wakes up periodically, asks every dispatcher for
//! its registered connections and lets each check its own deadlines. The
//! period is a fifth of the smallest timeout in use.

use crate::dispatcher::DispatcherPool;
use crate::error::Error;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

const MIN_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct WatchdogState {
    period: Option<Duration>,
    shutdown: bool,
}

/// What a timeout check fired.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutCheck {
    pub(crate) idle: bool,
    pub(crate) connection: bool,
}

#[derive(Debug)]
pub(crate) struct Watchdog {
    state: Mutex<WatchdogState>,
    wakeup: Condvar,
    idle_timeouts: AtomicUsize,
    connection_timeouts: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub(crate) fn start(name: &str, pool: Weak<DispatcherPool>) -> Result<Arc<Self>, Error> {
        let watchdog = Arc::new(Self {
            state: Mutex::new(WatchdogState::default()),
            wakeup: Condvar::new(),
            idle_timeouts: AtomicUsize::new(0),
            connection_timeouts: AtomicUsize::new(0),
            thread: Mutex::new(None),
        });

        let name = if name.is_empty() { "watchdog".to_string() } else { format!("{name}-watchdog") };
        let runner = Arc::downgrade(&watchdog);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(&runner, &pool))?;
        *crate::lock(&watchdog.thread) = Some(thread);

        Ok(watchdog)
    }

    /// Makes sure the check runs often enough for `timeout`.
    pub(crate) fn require_period(&self, timeout: Duration) {
        let period = (timeout / 5).max(MIN_PERIOD);
        let mut state = crate::lock(&self.state);
        if state.period.map_or(true, |current| period < current) {
            debug!(?period, "Watchdog period set");
            state.period = Some(period);
            self.wakeup.notify_all();
        }
    }

    pub(crate) fn idle_timeouts(&self) -> usize {
        self.idle_timeouts.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_timeouts(&self) -> usize {
        self.connection_timeouts.load(Ordering::Relaxed)
    }

    /// Runs one check over every registered connection.
    pub(crate) fn check(&self, pool: &DispatcherPool) {
        let now = Instant::now();
        let connections = pool.registered_connections();
        trace!(count = connections.len(), "Checking timeouts");

        for connection in connections {
            let fired = connection.check_timeouts(now);
            if fired.idle {
                self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            if fired.connection {
                self.connection_timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut state = crate::lock(&self.state);
            state.shutdown = true;
            self.wakeup.notify_all();
        }
        if let Some(thread) = crate::lock(&self.thread).take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Watchdog thread panicked");
            }
        }
    }
}

// Waits for the next period; returns false on shutdown.
fn wait(watchdog: &Watchdog) -> bool {
    let mut state = crate::lock(&watchdog.state);
    loop {
        if state.shutdown {
            return false;
        }
        match state.period {
            None => {
                state = watchdog
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            Some(period) => {
                let (guard, result) = watchdog
                    .wakeup
                    .wait_timeout(state, period)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state = guard;
                if result.timed_out() {
                    return !state.shutdown;
                }
            }
        }
    }
}

fn run(watchdog: &Weak<Watchdog>, pool: &Weak<DispatcherPool>) {
    loop {
        let Some(watchdog) = watchdog.upgrade() else {
            break;
        };
        if !wait(&watchdog) {
            break;
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.is_closed() {
            break;
        }
        watchdog.check(&pool);
    }
    debug!("Watchdog stopped");
}
