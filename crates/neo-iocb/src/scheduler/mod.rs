//! Deferred execution and timers
//!
//! The dispatch core never calls back into itself recursively. Re-dispatch
//! after a completion and every timeout go through a `Scheduler`, which runs
//! work later on its own execution context.
//!
//! Two implementations are provided:
//! - `TokioScheduler`: spawns onto a tokio runtime
//! - `ThreadReactor`: a dedicated thread with its own timer heap

mod reactor;
mod runtime;

pub use reactor::ThreadReactor;
pub use runtime::TokioScheduler;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A unit of deferred work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Capability to run work later without recursing through the caller's stack
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` on the scheduler's execution context as soon as possible.
    ///
    /// Must never run the task inline on the calling thread.
    fn defer(&self, task: Task);

    /// Run `task` once `delay` has elapsed, unless the returned handle is
    /// cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

// ─────────────────────────────────────────────────────────────────────────────
// Timer Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a scheduled task
///
/// Cancelling is idempotent and safe from any thread. A task that has already
/// started running is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_abort(mut self, abort: tokio::task::AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Shared flag the scheduled task checks before running
    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Prevent the task from running
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// Check if `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
