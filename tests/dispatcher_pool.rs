//! Dispatcher pool sizing and round-robin assignment.

mod test_support;

use nbconn::prelude::*;
use nbconn::{Dispatcher, DispatcherPoolListener};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use test_support::{init_tracing, test_settings, wait_until};

const WAIT: Duration = Duration::from_secs(5);

struct Quiet;

impl ConnectionHandler for Quiet {}

#[derive(Default)]
struct Membership {
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl DispatcherPoolListener for Membership {
    fn on_dispatcher_added(&self, dispatcher: &Dispatcher) {
        self.added.lock().unwrap().push(dispatcher.name().to_string());
    }

    fn on_dispatcher_removed(&self, dispatcher: &Dispatcher) {
        self.removed.lock().unwrap().push(dispatcher.name().to_string());
    }
}

#[test]
fn next_dispatcher_is_round_robin() {
    init_tracing();
    let context = IoContext::from_settings(test_settings("rr", 3)).unwrap();
    let pool = context.pool();
    assert_eq!(pool.size(), 3);

    let names: Vec<String> = (0..7)
        .map(|_| pool.next_dispatcher().unwrap().name().to_string())
        .collect();
    assert_eq!(names, ["rr#0", "rr#1", "rr#2", "rr#0", "rr#1", "rr#2", "rr#0"]);

    context.shutdown();
}

#[test]
fn accepted_connections_spread_evenly() {
    init_tracing();
    let context = IoContext::from_settings(test_settings("spread", 3)).unwrap();
    let acceptor = Acceptor::bind(&context, "127.0.0.1:0", HandlerPrototype::shared(Quiet)).unwrap();
    let (handle, thread) = acceptor.spawn().unwrap();

    let clients: Vec<TcpStream> = (0..10)
        .map(|_| TcpStream::connect(handle.local_addr()).unwrap())
        .collect();
    assert!(wait_until(WAIT, || context.pool().open_connections() == 10));

    // 10 over 3 is 4, 3 and 3 in some order
    let mut counts: Vec<usize> = context
        .pool()
        .dispatchers()
        .iter()
        .map(|dispatcher| dispatcher.open_connections())
        .collect();
    counts.sort_unstable();
    assert_eq!(counts, [3, 3, 4]);
    assert_eq!(context.pool().registered_connections().len(), 10);

    drop(clients);
    assert!(wait_until(WAIT, || context.pool().open_connections() == 0));

    handle.shutdown();
    thread.join().unwrap().unwrap();
    context.shutdown();
}

#[test]
fn resizing_notifies_listeners() {
    init_tracing();
    let context = IoContext::from_settings(test_settings("resize", 1)).unwrap();
    let pool = context.pool();
    let membership = Arc::new(Membership::default());
    pool.add_listener(membership.clone());

    pool.set_size(3).unwrap();
    assert_eq!(pool.size(), 3);
    assert_eq!(*membership.added.lock().unwrap(), ["resize#1", "resize#2"]);

    pool.set_size(2).unwrap();
    assert_eq!(pool.size(), 2);
    assert_eq!(*membership.removed.lock().unwrap(), ["resize#2"]);

    // Names keep counting up after a shrink
    pool.set_size(3).unwrap();
    assert_eq!(membership.added.lock().unwrap().last().unwrap(), "resize#3");

    context.shutdown();
    assert!(pool.set_size(4).is_err());
}

#[test]
fn retired_dispatcher_keeps_its_connections() {
    init_tracing();
    let context = IoContext::from_settings(test_settings("retire", 2)).unwrap();
    let acceptor = Acceptor::bind(&context, "127.0.0.1:0", HandlerPrototype::shared(Quiet)).unwrap();
    let (handle, thread) = acceptor.spawn().unwrap();

    let first = TcpStream::connect(handle.local_addr()).unwrap();
    let second = TcpStream::connect(handle.local_addr()).unwrap();
    assert!(wait_until(WAIT, || context.pool().open_connections() == 2));

    let retired = context.pool().dispatchers()[1].clone();
    context.pool().set_size(1).unwrap();
    assert_eq!(context.pool().size(), 1);

    // Still serving its connection, and still counted
    assert!(retired.is_running());
    assert_eq!(context.pool().open_connections(), 2);

    drop(first);
    drop(second);
    assert!(wait_until(WAIT, || context.pool().open_connections() == 0));
    assert!(wait_until(WAIT, || !retired.is_running()));

    handle.shutdown();
    thread.join().unwrap().unwrap();
    context.shutdown();
}

/// Asks the pool for a snapshot from an inline `on_connect`.
#[derive(Default)]
struct InlineSnapshot {
    context: OnceLock<IoContext>,
    result: Mutex<Option<(usize, Duration)>>,
}

impl ConnectionHandler for InlineSnapshot {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::NonThreaded
    }

    fn on_connect(&self, _connection: &Connection) -> Result<bool, Error> {
        if let Some(context) = self.context.get() {
            let started = Instant::now();
            let count = context.pool().registered_connections().len();
            *self.result.lock().unwrap() = Some((count, started.elapsed()));
        }
        Ok(true)
    }
}

#[test]
fn snapshot_from_reactor_thread_returns_at_once() {
    init_tracing();
    let context = IoContext::from_settings(test_settings("inline", 1)).unwrap();
    let handler = Arc::new(InlineSnapshot::default());
    assert!(handler.context.set(context.clone()).is_ok());

    let acceptor =
        Acceptor::bind(&context, "127.0.0.1:0", HandlerPrototype::Shared(handler.clone())).unwrap();
    let (handle, thread) = acceptor.spawn().unwrap();

    let _client = TcpStream::connect(handle.local_addr()).unwrap();
    assert!(wait_until(WAIT, || handler.result.lock().unwrap().is_some()));

    let (count, elapsed) = (*handler.result.lock().unwrap()).unwrap();
    // The only reactor is the one asking
    assert_eq!(count, 0);
    assert!(elapsed < Duration::from_secs(1), "snapshot took {elapsed:?}");

    // Other threads still get the full picture
    assert_eq!(context.pool().registered_connections().len(), 1);

    handle.shutdown();
    thread.join().unwrap().unwrap();
    context.shutdown();
}
