//! Callback execution off the reactor threads.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

use crate::error::Error;

/// A unit of work submitted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on some other thread.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Fixed-size pool of worker threads fed from one shared queue.
///
/// A panicking task is logged and does not take its worker down.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self, Error> {
        let (sender, receiver) = channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let name = if name.is_empty() { "worker" } else { name };

        let mut threads = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let receiver = receiver.clone();
            let thread = thread::Builder::new()
                .name(format!("{name}-worker#{index}"))
                .spawn(move || worker_loop(&receiver))?;
            threads.push(thread);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
        })
    }

    /// Stops accepting tasks and waits for the queued ones to finish.
    pub fn shutdown(&self) {
        // Dropping the sender ends every worker loop once the queue is empty
        crate::lock(&self.sender).take();

        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *crate::lock(&self.threads));
        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) {
        let sender = crate::lock(&self.sender);
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(task).is_err() {
                    warn!("Worker pool has stopped; task dropped");
                }
            }
            None => warn!("Worker pool is shut down; task dropped"),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Task>>) {
    loop {
        let task = {
            let receiver = crate::lock(receiver);
            receiver.recv()
        };
        match task {
            Ok(task) => run_task(task),
            Err(_) => break,
        }
    }
    debug!("Worker stopped");
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("Task panicked");
    }
}

// ============================================================================
// Serial Executor
// ============================================================================

#[derive(Default)]
struct SerialState {
    tasks: VecDeque<Task>,
    running: bool,
}

/// Runs the tasks of one connection on an [`Executor`], one at a time and in
/// submission order.
///
/// At most one drain task per serial executor is ever queued on the
/// underlying executor, so tasks of different connections still run in
/// parallel while tasks of the same connection never overlap.
#[derive(Clone)]
pub(crate) struct SerialExecutor {
    executor: Arc<dyn Executor>,
    state: Arc<Mutex<SerialState>>,
}

impl SerialExecutor {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            state: Arc::new(Mutex::new(SerialState::default())),
        }
    }

    pub(crate) fn execute(&self, task: Task) {
        {
            let mut state = crate::lock(&self.state);
            state.tasks.push_back(task);
            if state.running {
                return;
            }
            state.running = true;
        }

        let state = self.state.clone();
        self.executor.execute(Box::new(move || drain(&state)));
    }
}

fn drain(state: &Mutex<SerialState>) {
    loop {
        let task = {
            let mut state = crate::lock(state);
            match state.tasks.pop_front() {
                Some(task) => task,
                None => {
                    state.running = false;
                    return;
                }
            }
        };
        run_task(task);
    }
}
