//! Dedicated reactor thread
//!
//! Runs deferred tasks and timers on a single OS thread fed by a channel. All
//! work posted here is serialized, which gives controllers driven by this
//! reactor a single-writer execution context.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Scheduler, Task, TimerHandle};
use crate::config::ReactorConfig;

/// Stand-in deadline for delays past the end of `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Commands sent from handles to the reactor thread
enum ReactorCommand {
    /// Run a task on the next loop iteration
    Run(Task),
    /// Install a timer
    Schedule(Timer),
    /// Stop the loop
    Shutdown,
}

/// A pending timer, ordered so the earliest deadline sits on top of the heap
struct Timer {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Scheduler backed by a dedicated thread
pub struct ThreadReactor {
    name: String,
    cmd_tx: Sender<ReactorCommand>,
    next_seq: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl ThreadReactor {
    /// Spawn the reactor thread
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Arc<Self>> {
        let name = name.into();
        let (cmd_tx, cmd_rx) = mpsc::channel::<ReactorCommand>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(&thread_name, cmd_rx))?;

        Ok(Arc::new(Self {
            name,
            cmd_tx,
            next_seq: AtomicU64::new(0),
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        }))
    }

    /// Spawn the reactor thread named by `config`
    pub fn from_config(config: &ReactorConfig) -> std::io::Result<Arc<Self>> {
        Self::spawn(config.thread_name.clone())
    }

    /// Reactor thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the caller is running on the reactor thread
    pub fn is_reactor_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Wait until every task posted before this call has run.
    ///
    /// Returns false if the reactor did not get there within `timeout`, or is
    /// not running. Tasks those tasks defer in turn are not covered.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = mpsc::channel();
        self.defer(Box::new(move || {
            let _ = done_tx.send(());
        }));
        done_rx.recv_timeout(timeout).is_ok()
    }

    /// Stop the reactor thread, dropping any pending timers
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(ReactorCommand::Shutdown);

        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        // Joining ourselves would deadlock; the loop exits after this task.
        if self.is_reactor_thread() {
            return;
        }

        if handle.join().is_err() {
            tracing::error!("Reactor thread {} panicked", self.name);
        }
    }
}

impl Scheduler for ThreadReactor {
    fn defer(&self, task: Task) {
        if self.cmd_tx.send(ReactorCommand::Run(task)).is_err() {
            tracing::warn!("Reactor {} stopped, dropping deferred task", self.name);
        }
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        let timer = Timer {
            deadline,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            cancelled: handle.flag(),
            task,
        };

        if self.cmd_tx.send(ReactorCommand::Schedule(timer)).is_err() {
            tracing::warn!("Reactor {} stopped, dropping timer", self.name);
        }
        handle
    }
}

impl Drop for ThreadReactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadReactor")
            .field("name", &self.name)
            .finish()
    }
}

/// The reactor event loop
fn run(name: &str, cmd_rx: Receiver<ReactorCommand>) {
    tracing::debug!("Reactor {} started", name);
    let mut timers: BinaryHeap<Timer> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while timers.peek().is_some_and(|t| t.deadline <= now) {
            if let Some(timer) = timers.pop() {
                if !timer.cancelled.load(Ordering::SeqCst) {
                    run_task(name, timer.task);
                }
            }
        }

        let command = match timers.peek() {
            Some(next) => {
                let wait = next.deadline.saturating_duration_since(Instant::now());
                match cmd_rx.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match cmd_rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            ReactorCommand::Run(task) => run_task(name, task),
            ReactorCommand::Schedule(timer) => timers.push(timer),
            ReactorCommand::Shutdown => break,
        }
    }

    tracing::debug!("Reactor {} stopped ({} timers dropped)", name, timers.len());
}

fn run_task(name: &str, task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!("Task panicked on reactor {}", name);
    }
}
