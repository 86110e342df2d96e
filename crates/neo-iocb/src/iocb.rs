//! I/O Control Block
//!
//! An `Iocb` is one unit of request/response work: the request payload, its
//! eventual result, a single-fire completion signal, and the callbacks to run
//! when it finishes.
//!
//! # Lifecycle
//!
//! ```text
//! IDLE ──request()──▶ PENDING ──dispatch──▶ ACTIVE ──┬──▶ COMPLETED
//!                        │                           └──▶ ABORTED
//!                        └──────────abort()──────────────▶ ABORTED
//! ```
//!
//! The caller may only submit, wait and abort. Terminal transitions are owned
//! by whichever controller the block is bound to; an unbound block moves
//! directly. Once terminal, further `complete`/`abort` calls are ignored so
//! that duplicate network responses are harmless.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::controller::IoController;
use crate::error::{IocbError, IocbResult};
use crate::queue::QueueInner;
use crate::scheduler::{Scheduler, Task, TimerHandle};

/// Priority assigned when none is given
pub const DEFAULT_PRIORITY: i32 = 0;

/// Result carried by a terminal block
pub type Outcome<T> = Result<T, IocbError>;

type Callback<Resp> = Box<dyn FnOnce(&Outcome<Resp>) + Send + 'static>;

// ─────────────────────────────────────────────────────────────────────────────
// Identity & State
// ─────────────────────────────────────────────────────────────────────────────

/// Block identity, unique and increasing within one `IoContext`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IocbId(pub(crate) u64);

impl IocbId {
    /// Raw id value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for IocbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current state of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IocbState {
    /// Created, not yet submitted
    Idle,
    /// Bound to a controller, waiting for its turn
    Pending,
    /// Handed to the transport
    Active,
    /// Finished with a response
    Completed,
    /// Finished with an error
    Aborted,
}

impl IocbState {
    /// Check if the block has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, IocbState::Completed | IocbState::Aborted)
    }
}

impl std::fmt::Display for IocbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IocbState::Idle => write!(f, "idle"),
            IocbState::Pending => write!(f, "pending"),
            IocbState::Active => write!(f, "active"),
            IocbState::Completed => write!(f, "completed"),
            IocbState::Aborted => write!(f, "aborted"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control Block
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable part of a block, guarded by one lock
struct Slot<Req, Resp> {
    state: IocbState,
    outcome: Option<Outcome<Resp>>,
    callbacks: VecDeque<Callback<Resp>>,
    /// Completion signal has fired
    signaled: bool,
    /// Callbacks have been drained; later registrations run immediately
    drained: bool,
    controller: Option<Weak<dyn IoController<Req, Resp>>>,
    queue: Option<Weak<QueueInner<Req, Resp>>>,
    timeout: Option<TimerHandle>,
}

struct IocbInner<Req, Resp> {
    id: IocbId,
    request: Req,
    priority: i32,
    scheduler: Arc<dyn Scheduler>,
    slot: Mutex<Slot<Req, Resp>>,
    done: Condvar,
    notify: Notify,
}

/// Handle to a control block
///
/// Cloning is cheap and every clone refers to the same block. The block is
/// freed once the caller, queues and controllers have all let go of it.
pub struct Iocb<Req, Resp> {
    inner: Arc<IocbInner<Req, Resp>>,
}

impl<Req, Resp> Clone for Iocb<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req, Resp> Iocb<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(id: IocbId, request: Req, priority: i32, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(IocbInner {
                id,
                request,
                priority,
                scheduler,
                slot: Mutex::new(Slot {
                    state: IocbState::Idle,
                    outcome: None,
                    callbacks: VecDeque::new(),
                    signaled: false,
                    drained: false,
                    controller: None,
                    queue: None,
                    timeout: None,
                }),
                done: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> IocbId {
        self.inner.id
    }

    /// Request payload supplied at creation
    pub fn request(&self) -> &Req {
        &self.inner.request
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    pub fn state(&self) -> IocbState {
        self.inner.slot.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Terminal result, `None` while the block is still in flight
    pub fn result(&self) -> Option<Outcome<Resp>> {
        self.inner.slot.lock().outcome.clone()
    }

    /// Response of a completed block
    pub fn response(&self) -> Option<Resp> {
        self.result().and_then(Result::ok)
    }

    /// Error of an aborted block
    pub fn error(&self) -> Option<IocbError> {
        self.result().and_then(Result::err)
    }

    /// Check if two handles refer to the same block
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Type-erased handle, for joining into a group
    pub fn as_completion(&self) -> Arc<dyn Completion> {
        Arc::new(self.clone())
    }

    /// Block until the completion signal fires or `timeout` elapses.
    ///
    /// Returns true if the block finished. Success and failure are not
    /// distinguished here; inspect `result()` afterwards. A timeout too large
    /// to represent waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut slot = self.inner.slot.lock();

        while !slot.signaled {
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut slot, deadline).timed_out() {
                        return slot.signaled;
                    }
                }
                None => self.inner.done.wait(&mut slot),
            }
        }
        true
    }

    /// Wait for the completion signal from async code
    pub async fn wait_async(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.slot.lock().signaled {
                return;
            }
            notified.await;
        }
    }

    /// Register a callback to run once, when the block finishes.
    ///
    /// Callbacks run in registration order on the thread that finishes the
    /// block. If the block has already finished, the callback runs
    /// immediately on the calling thread.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<Resp>) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.inner.slot.lock();
            if !slot.drained {
                slot.callbacks.push_back(Box::new(callback));
                return;
            }
            slot.outcome.clone()
        };

        if let Some(outcome) = outcome {
            callback(&outcome);
        }
    }

    /// Complete the block with a response.
    ///
    /// A bound block is completed through its controller, which fails with
    /// `ProtocolViolation` if the block is not the one it is servicing.
    pub fn complete(&self, response: Resp) -> IocbResult<()> {
        match self.controller() {
            Some(controller) => controller.complete_io(self, response),
            None => {
                if !self.resolve(Ok(response)) {
                    tracing::trace!("Iocb {} already finished, ignoring response", self.id());
                }
                Ok(())
            }
        }
    }

    /// Abort the block. Ignored if it has already finished.
    pub fn abort(&self, err: IocbError) {
        match self.controller() {
            Some(controller) => controller.abort_io(self, err),
            None => {
                if !self.resolve(Err(err)) {
                    tracing::trace!("Iocb {} already finished, ignoring abort", self.id());
                }
            }
        }
    }

    /// Abort with `err` after `delay` unless the block finishes first.
    ///
    /// Replaces any timeout set earlier.
    pub fn set_timeout(&self, delay: Duration, err: IocbError) {
        let weak = Arc::downgrade(&self.inner);
        let task: Task = Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let iocb = Iocb { inner };
            if !iocb.is_terminal() {
                tracing::debug!("Iocb {} timed out: {}", iocb.id(), err);
                iocb.abort(err);
            }
        });

        let timer = self.inner.scheduler.schedule(delay, task);

        let mut slot = self.inner.slot.lock();
        if slot.signaled {
            timer.cancel();
            return;
        }
        if let Some(previous) = slot.timeout.replace(timer) {
            previous.cancel();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Controller side
    // ─────────────────────────────────────────────────────────────────────

    fn controller(&self) -> Option<Arc<dyn IoController<Req, Resp>>> {
        self.inner
            .slot
            .lock()
            .controller
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Bind an idle block to a controller, moving it to PENDING
    pub(crate) fn bind(&self, controller: Weak<dyn IoController<Req, Resp>>) -> IocbResult<()> {
        self.bind_as(controller, IocbState::Pending)
    }

    /// Bind an idle block to a controller that services it immediately
    pub(crate) fn bind_active(&self, controller: Weak<dyn IoController<Req, Resp>>) -> IocbResult<()> {
        self.bind_as(controller, IocbState::Active)
    }

    fn bind_as(&self, controller: Weak<dyn IoController<Req, Resp>>, state: IocbState) -> IocbResult<()> {
        let mut slot = self.inner.slot.lock();
        if slot.state != IocbState::Idle {
            return Err(IocbError::InvalidState(format!(
                "iocb {} is {}, expected idle",
                self.inner.id, slot.state
            )));
        }
        slot.state = state;
        slot.controller = Some(controller);
        Ok(())
    }

    /// Drop the controller binding; later completions act directly
    pub(crate) fn unbind(&self) {
        self.inner.slot.lock().controller = None;
    }

    /// PENDING -> ACTIVE
    pub(crate) fn activate(&self) -> IocbResult<()> {
        let mut slot = self.inner.slot.lock();
        if slot.state != IocbState::Pending {
            return Err(IocbError::InvalidState(format!(
                "iocb {} is {}, expected pending",
                self.inner.id, slot.state
            )));
        }
        slot.state = IocbState::Active;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn mark_pending(&self) {
        self.inner.slot.lock().state = IocbState::Pending;
    }

    pub(crate) fn set_queue(&self, queue: Option<Weak<QueueInner<Req, Resp>>>) {
        self.inner.slot.lock().queue = queue;
    }

    /// Record the terminal result. Returns false if the block had already
    /// finished, in which case nothing changes.
    pub(crate) fn settle(&self, outcome: Outcome<Resp>) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.state.is_terminal() {
            return false;
        }
        slot.state = match outcome {
            Ok(_) => IocbState::Completed,
            Err(_) => IocbState::Aborted,
        };
        slot.outcome = Some(outcome);
        true
    }

    /// Fire the completion signal, leave any queue, cancel the timeout and
    /// run the callbacks. Only the first call after `settle` has any effect.
    pub(crate) fn fire(&self) {
        let (queue, timeout) = {
            let mut slot = self.inner.slot.lock();
            if slot.signaled || !slot.state.is_terminal() {
                return;
            }
            slot.signaled = true;
            (slot.queue.take(), slot.timeout.take())
        };

        self.inner.done.notify_all();
        self.inner.notify.notify_waiters();

        if let Some(queue) = queue.and_then(|q| q.upgrade()) {
            queue.remove(self.id());
        }
        if let Some(timer) = timeout {
            timer.cancel();
        }

        self.drain_callbacks();
    }

    /// Settle and fire in one step
    pub(crate) fn resolve(&self, outcome: Outcome<Resp>) -> bool {
        let settled = self.settle(outcome);
        if settled {
            self.fire();
        }
        settled
    }

    fn drain_callbacks(&self) {
        loop {
            let (callback, outcome) = {
                let mut slot = self.inner.slot.lock();
                match slot.callbacks.pop_front() {
                    Some(callback) => (callback, slot.outcome.clone()),
                    None => {
                        slot.drained = true;
                        return;
                    }
                }
            };

            if let Some(outcome) = outcome {
                callback(&outcome);
            }
        }
    }
}

impl<Req, Resp> std::fmt::Debug for Iocb<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iocb")
            .field("id", &self.inner.id)
            .field("state", &self.inner.slot.lock().state)
            .field("priority", &self.inner.priority)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion
// ─────────────────────────────────────────────────────────────────────────────

/// Type-erased view of anything that finishes exactly once
///
/// Lets a group join blocks of different request/response types, including
/// other groups.
pub trait Completion: Send + Sync {
    fn id(&self) -> IocbId;

    fn is_terminal(&self) -> bool;

    fn abort(&self, err: IocbError);

    /// Run `f` once this finishes, immediately if it already has
    fn on_terminal(&self, f: Box<dyn FnOnce() + Send + 'static>);
}

impl<Req, Resp> Completion for Iocb<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    fn id(&self) -> IocbId {
        Iocb::id(self)
    }

    fn is_terminal(&self) -> bool {
        Iocb::is_terminal(self)
    }

    fn abort(&self, err: IocbError) {
        Iocb::abort(self, err)
    }

    fn on_terminal(&self, f: Box<dyn FnOnce() + Send + 'static>) {
        self.add_callback(move |_| f());
    }
}
