//! Idle and connection timeouts driven by the watchdog.

mod test_support;

use nbconn::prelude::*;
use nbconn::Settings;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use test_support::{init_tracing, test_settings, wait_until};

const WAIT: Duration = Duration::from_secs(5);

struct TimeoutHandler {
    handle_timeouts: bool,
    connection_timeout: Option<Duration>,
    idle_fired: AtomicUsize,
    connection_fired: AtomicUsize,
    disconnected: AtomicBool,
}

impl TimeoutHandler {
    fn new(handle_timeouts: bool, connection_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            handle_timeouts,
            connection_timeout,
            idle_fired: AtomicUsize::new(0),
            connection_fired: AtomicUsize::new(0),
            disconnected: AtomicBool::new(false),
        })
    }
}

impl ConnectionHandler for TimeoutHandler {
    fn on_connect(&self, connection: &Connection) -> Result<bool, Error> {
        if let Some(timeout) = self.connection_timeout {
            connection.set_connection_timeout(timeout);
        }
        Ok(true)
    }

    fn on_data(&self, connection: &Connection) -> Result<bool, Error> {
        connection.read_available();
        Ok(true)
    }

    fn on_disconnect(&self, _connection: &Connection) -> Result<bool, Error> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn on_idle_timeout(&self, _connection: &Connection) -> Result<bool, Error> {
        self.idle_fired.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle_timeouts)
    }

    fn on_connection_timeout(&self, _connection: &Connection) -> Result<bool, Error> {
        self.connection_fired.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle_timeouts)
    }
}

fn start(
    settings: Settings,
    handler: Arc<TimeoutHandler>,
) -> (IoContext, AcceptorHandle, thread::JoinHandle<Result<(), Error>>) {
    init_tracing();
    let context = IoContext::from_settings(settings).unwrap();
    let acceptor =
        Acceptor::bind(&context, "127.0.0.1:0", HandlerPrototype::Shared(handler)).unwrap();
    let (handle, thread) = acceptor.spawn().unwrap();
    (context, handle, thread)
}

fn stop(context: IoContext, handle: AcceptorHandle, thread: thread::JoinHandle<Result<(), Error>>) {
    handle.shutdown();
    thread.join().unwrap().unwrap();
    context.shutdown();
}

fn idle_settings(idle: Duration) -> Settings {
    Settings {
        idle_timeout: Some(idle),
        ..test_settings("timeouts", 1)
    }
}

#[test]
fn handled_idle_timeout_fires_once_until_data_arrives() {
    let handler = TimeoutHandler::new(true, None);
    let (context, handle, thread) = start(idle_settings(Duration::from_millis(100)), handler.clone());

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    assert!(wait_until(WAIT, || handler.idle_fired.load(Ordering::SeqCst) == 1));

    // Stays at one while the connection keeps idling
    thread::sleep(Duration::from_millis(400));
    assert_eq!(handler.idle_fired.load(Ordering::SeqCst), 1);
    assert_eq!(context.idle_timeout_count(), 1);

    let connection = context.pool().registered_connections()[0].clone();
    assert!(connection.is_open());
    assert_eq!(connection.idle_timeout(), Some(Duration::from_millis(100)));

    // Data re-arms the timeout
    stream.write_all(b"ping").unwrap();
    assert!(wait_until(WAIT, || handler.idle_fired.load(Ordering::SeqCst) == 2));
    assert!(!handler.disconnected.load(Ordering::SeqCst));

    stop(context, handle, thread);
}

#[test]
fn unhandled_idle_timeout_closes() {
    let handler = TimeoutHandler::new(false, None);
    let (context, handle, thread) = start(idle_settings(Duration::from_millis(100)), handler.clone());

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();

    let mut buf = [0u8; 16];
    let read = stream.read(&mut buf);
    assert!(matches!(read, Ok(0)) || read.is_err());

    assert!(wait_until(WAIT, || handler.disconnected.load(Ordering::SeqCst)));
    assert_eq!(handler.idle_fired.load(Ordering::SeqCst), 1);
    assert_eq!(context.pool().open_connections(), 0);

    stop(context, handle, thread);
}

#[test]
fn connection_timeout_ignores_activity() {
    let handler = TimeoutHandler::new(false, Some(Duration::from_millis(300)));
    let (context, handle, thread) = start(test_settings("timeouts", 1), handler.clone());

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    // Keep the connection busy; it still times out
    for _ in 0..10 {
        if stream.write_all(b"busy").is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    assert!(wait_until(WAIT, || handler.disconnected.load(Ordering::SeqCst)));
    assert_eq!(handler.connection_fired.load(Ordering::SeqCst), 1);
    assert_eq!(handler.idle_fired.load(Ordering::SeqCst), 0);
    assert!(wait_until(WAIT, || context.connection_timeout_count() == 1));

    stop(context, handle, thread);
}

#[test]
fn idle_timeout_set_per_connection() {
    struct SetsTimeout(AtomicUsize);

    impl ConnectionHandler for SetsTimeout {
        fn descriptor(&self) -> HandlerDescriptor {
            HandlerDescriptor::NonThreaded
        }

        fn on_connect(&self, connection: &Connection) -> Result<bool, Error> {
            connection.set_idle_timeout(Duration::from_millis(80));
            Ok(true)
        }

        fn on_idle_timeout(&self, connection: &Connection) -> Result<bool, Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            connection.write_str("idle\n")?;
            Ok(true)
        }
    }

    init_tracing();
    let handler = Arc::new(SetsTimeout(AtomicUsize::new(0)));
    let context = IoContext::from_settings(test_settings("timeouts", 1)).unwrap();
    let acceptor =
        Acceptor::bind(&context, "127.0.0.1:0", HandlerPrototype::Shared(handler.clone())).unwrap();
    let (handle, thread) = acceptor.spawn().unwrap();

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"idle\n");
    assert_eq!(handler.0.load(Ordering::SeqCst), 1);

    stop(context, handle, thread);
}
