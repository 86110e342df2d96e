//! Serializing Controller
//!
//! A `Controller` drives blocks from submission to completion and enforces
//! admission control: at most one block is ACTIVE under a controller at any
//! moment. Requests that arrive while it is busy wait in its `IoQueue`.
//!
//! # States
//!
//! ```text
//!          request()                  complete_io / abort_io
//! IDLE ───────────────▶ ACTIVE ───────────────────────────────┐
//!  ▲                                                          │
//!  │                  quiescent delay elapsed                 ▼
//!  └──────────────────────────────────────────────────── WAITING
//! ```
//!
//! With no quiescent delay configured the controller goes straight back to
//! IDLE. Dispatching the next queued block is always posted to the scheduler
//! rather than called inline, so a burst of blocks that fail synchronously
//! cannot grow the stack.
//!
//! # Locking
//!
//! The controller lock is taken before a block's lock or the queue's lock,
//! never after. The transport and block callbacks always run with no
//! controller lock held, so they may re-enter the controller.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ControllerConfig;
use crate::context::{Abortable, IoContext};
use crate::error::{IocbError, IocbResult};
use crate::iocb::{Iocb, Outcome};
use crate::queue::IoQueue;

const STATE_TARGET: &str = "neo_iocb::state";

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of a block's terminal transition
///
/// `Iocb::complete` and `Iocb::abort` on a bound block are routed here.
pub trait IoController<Req, Resp>: Send + Sync {
    /// Deliver a response for `iocb`
    fn complete_io(&self, iocb: &Iocb<Req, Resp>, response: Resp) -> IocbResult<()>;

    /// Abort `iocb`, whether it is active or still waiting
    fn abort_io(&self, iocb: &Iocb<Req, Resp>, err: IocbError);
}

/// Downstream hook that puts a block on the wire
///
/// Called exactly once per dispatched block. The transport must eventually
/// call `Iocb::complete`/`Iocb::abort` (or `Controller::confirm`), possibly
/// from another thread; a transport that may never answer should be covered
/// by a block timeout. Returning an error aborts the block immediately.
pub trait Transport<Req, Resp>: Send + Sync + 'static {
    fn process(&self, iocb: &Iocb<Req, Resp>) -> IocbResult<()>;
}

impl<Req, Resp, F> Transport<Req, Resp> for F
where
    F: Fn(&Iocb<Req, Resp>) -> IocbResult<()> + Send + Sync + 'static,
{
    fn process(&self, iocb: &Iocb<Req, Resp>) -> IocbResult<()> {
        self(iocb)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State & Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Current state of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Nothing in flight
    Idle,
    /// One block handed to the transport
    Active,
    /// Pausing after a completion before the next dispatch
    Waiting,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::Active => write!(f, "active"),
            ControllerState::Waiting => write!(f, "waiting"),
        }
    }
}

/// Snapshot of a controller's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStats {
    pub name: String,
    pub state: ControllerState,
    pub queued: usize,
    pub dispatched: u64,
    pub completed: u64,
    pub aborted: u64,
}

/// What to do once the active slot frees up
enum FollowUp {
    /// Post a trigger to the scheduler
    Trigger,
    /// Sit in WAITING for the quiescent delay first
    Wait(Duration),
}

/// Invoked when a trigger finds nothing left to do
pub(crate) type IdleHook<Req, Resp> = Box<dyn Fn(&Controller<Req, Resp>) + Send + Sync>;

struct ControllerInner<Req, Resp> {
    state: ControllerState,
    active: Option<Iocb<Req, Resp>>,
    dispatched: u64,
    completed: u64,
    aborted: u64,
}

impl<Req, Resp> ControllerInner<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    fn is_active(&self, iocb: &Iocb<Req, Resp>) -> bool {
        self.active.as_ref().is_some_and(|active| active.ptr_eq(iocb))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

/// Admission controller allowing one in-flight block at a time
pub struct Controller<Req, Resp> {
    me: Weak<Self>,
    name: String,
    ctx: IoContext,
    transport: Arc<dyn Transport<Req, Resp>>,
    config: ControllerConfig,
    queue: IoQueue<Req, Resp>,
    inner: Mutex<ControllerInner<Req, Resp>>,
    idle_hook: Option<IdleHook<Req, Resp>>,
}

impl<Req, Resp> Controller<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    /// Create a controller in front of `transport`
    pub fn new(
        ctx: &IoContext,
        name: impl Into<String>,
        transport: Arc<dyn Transport<Req, Resp>>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Self::build(ctx, name.into(), transport, config, None)
    }

    pub(crate) fn build(
        ctx: &IoContext,
        name: String,
        transport: Arc<dyn Transport<Req, Resp>>,
        config: ControllerConfig,
        idle_hook: Option<IdleHook<Req, Resp>>,
    ) -> Arc<Self> {
        tracing::debug!(target: STATE_TARGET, "{} idle", name);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue: IoQueue::new(format!("{} queue", name)),
            name,
            ctx: ctx.clone(),
            transport,
            config,
            inner: Mutex::new(ControllerInner {
                state: ControllerState::Idle,
                active: None,
                dispatched: 0,
                completed: 0,
                aborted: 0,
            }),
            idle_hook,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        self.inner.lock().state
    }

    /// The block currently handed to the transport
    pub fn active(&self) -> Option<Iocb<Req, Resp>> {
        self.inner.lock().active.clone()
    }

    /// Blocks waiting behind the active one
    pub fn queue(&self) -> &IoQueue<Req, Resp> {
        &self.queue
    }

    /// Idle, nothing in flight and nothing queued
    pub fn is_quiescent(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == ControllerState::Idle && inner.active.is_none() && self.queue.is_empty()
    }

    pub fn stats(&self) -> ControllerStats {
        let inner = self.inner.lock();
        ControllerStats {
            name: self.name.clone(),
            state: inner.state,
            queued: self.queue.len(),
            dispatched: inner.dispatched,
            completed: inner.completed,
            aborted: inner.aborted,
        }
    }

    /// Create a block for `request`, apply the configured request timeout and
    /// submit it
    pub fn submit(&self, request: Req, priority: i32) -> IocbResult<Iocb<Req, Resp>> {
        let iocb = self.ctx.iocb_with_priority(request, priority);
        if let Some(timeout) = self.config.request_timeout() {
            iocb.set_timeout(timeout, IocbError::Timeout);
        }
        self.request(iocb.clone())?;
        Ok(iocb)
    }

    /// Submit an idle block: dispatch it now if the controller is idle,
    /// otherwise queue it
    pub fn request(&self, iocb: Iocb<Req, Resp>) -> IocbResult<()> {
        if let Some(iocb) = self.admit(&iocb)? {
            self.dispatch(iocb);
        }
        Ok(())
    }

    /// Bind `iocb` and either claim the active slot for it or queue it.
    ///
    /// Returns the block when the caller must dispatch it. Nothing outside
    /// this controller is called while its lock is held, so this is safe to
    /// run under a registry lock.
    pub(crate) fn admit(&self, iocb: &Iocb<Req, Resp>) -> IocbResult<Option<Iocb<Req, Resp>>> {
        let link: Weak<dyn IoController<Req, Resp>> = self.me.clone();

        let mut inner = self.inner.lock();
        iocb.bind(link)?;

        if inner.state == ControllerState::Idle && inner.active.is_none() && self.queue.is_empty() {
            iocb.activate()?;
            inner.state = ControllerState::Active;
            inner.active = Some(iocb.clone());
            inner.dispatched += 1;
            tracing::debug!(target: STATE_TARGET, "{} active", self.name);
            return Ok(Some(iocb.clone()));
        }

        let idle = inner.state == ControllerState::Idle;
        self.queue.put(iocb)?;
        drop(inner);

        tracing::debug!("{} busy, queued iocb {}", self.name, iocb.id());
        if idle {
            // Idle with a backlog: a trigger is due, make sure one is posted
            self.defer_trigger();
        }
        Ok(None)
    }

    /// Hand an active block to the transport.
    ///
    /// A block aborted between admission and this call is not sent.
    pub(crate) fn dispatch(&self, iocb: Iocb<Req, Resp>) {
        if iocb.is_terminal() {
            tracing::debug!("{} skipping iocb {}, finished before dispatch", self.name, iocb.id());
            return;
        }
        tracing::trace!("{} dispatching iocb {}", self.name, iocb.id());
        if let Err(err) = self.transport.process(&iocb) {
            tracing::warn!("{} transport rejected iocb {}: {}", self.name, iocb.id(), err);
            self.abort_io(&iocb, err);
        }
    }

    /// Deliver a response or error to whichever block is active.
    ///
    /// For transports that cannot name the block a response belongs to.
    /// Returns false if nothing was active.
    pub fn confirm(&self, outcome: Outcome<Resp>) -> bool {
        let Some(active) = self.active() else {
            tracing::debug!("{} has no active request", self.name);
            return false;
        };

        match outcome {
            Ok(response) => {
                if let Err(err) = self.complete_io(&active, response) {
                    tracing::error!("{} failed to confirm iocb {}: {}", self.name, active.id(), err);
                }
            }
            Err(err) => self.abort_io(&active, err),
        }
        true
    }

    /// Abort the active block and everything queued
    pub fn abort(&self, err: IocbError) {
        let active = {
            let inner = self.inner.lock();
            if inner.state == ControllerState::Idle && self.queue.is_empty() {
                return;
            }
            inner.active.clone()
        };

        tracing::debug!("{} aborting: {}", self.name, err);
        self.queue.abort_all(err.clone());
        if let Some(active) = active {
            self.abort_io(&active, err);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Re-dispatch
    // ─────────────────────────────────────────────────────────────────────

    /// Move out of ACTIVE once the slot is free
    fn release(&self, inner: &mut ControllerInner<Req, Resp>) -> FollowUp {
        let delay = self.config.quiescent_delay();
        if delay.is_zero() {
            inner.state = ControllerState::Idle;
            tracing::debug!(target: STATE_TARGET, "{} idle", self.name);
            FollowUp::Trigger
        } else {
            inner.state = ControllerState::Waiting;
            tracing::debug!(target: STATE_TARGET, "{} waiting", self.name);
            FollowUp::Wait(delay)
        }
    }

    fn follow_up(&self, next: FollowUp) {
        match next {
            FollowUp::Trigger => self.defer_trigger(),
            FollowUp::Wait(delay) => {
                let me = self.me.clone();
                self.ctx.scheduler().schedule(
                    delay,
                    Box::new(move || {
                        if let Some(controller) = me.upgrade() {
                            controller.wait_trigger();
                        }
                    }),
                );
            }
        }
    }

    fn defer_trigger(&self) {
        let me = self.me.clone();
        self.ctx.scheduler().defer(Box::new(move || {
            if let Some(controller) = me.upgrade() {
                controller.trigger();
            }
        }));
    }

    /// Launch the next queued block if idle
    fn trigger(&self) {
        let next = {
            let mut inner = self.inner.lock();
            if inner.state != ControllerState::Idle {
                tracing::trace!("{} not idle, trigger ignored", self.name);
                return;
            }

            loop {
                let Some(iocb) = self.queue.get(false, None) else {
                    break None;
                };
                // Aborted while queued but not yet removed
                if iocb.is_terminal() {
                    continue;
                }
                if let Err(err) = iocb.activate() {
                    tracing::error!("{} cannot activate iocb {}: {}", self.name, iocb.id(), err);
                    continue;
                }
                inner.state = ControllerState::Active;
                inner.active = Some(iocb.clone());
                inner.dispatched += 1;
                tracing::debug!(target: STATE_TARGET, "{} active", self.name);
                break Some(iocb);
            }
        };

        match next {
            Some(iocb) => self.dispatch(iocb),
            None => {
                if let Some(hook) = &self.idle_hook {
                    hook(self);
                }
            }
        }
    }

    /// End of the quiescent delay
    fn wait_trigger(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != ControllerState::Waiting {
                tracing::error!("{} wait elapsed while {}, expected waiting", self.name, inner.state);
                return;
            }
            inner.state = ControllerState::Idle;
            tracing::debug!(target: STATE_TARGET, "{} idle", self.name);
        }
        self.trigger();
    }
}

impl<Req, Resp> IoController<Req, Resp> for Controller<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    fn complete_io(&self, iocb: &Iocb<Req, Resp>, response: Resp) -> IocbResult<()> {
        let next = {
            let mut inner = self.inner.lock();

            if iocb.is_terminal() {
                tracing::debug!("{} ignoring duplicate completion of iocb {}", self.name, iocb.id());
                return Ok(());
            }
            if !inner.is_active(iocb) {
                drop(inner);
                tracing::error!("{} completion for iocb {} which is not the active request", self.name, iocb.id());
                return Err(IocbError::ProtocolViolation(format!(
                    "{}: iocb {} is not the active request",
                    self.name,
                    iocb.id()
                )));
            }

            inner.active = None;
            inner.completed += 1;
            iocb.settle(Ok(response));
            self.release(&mut inner)
        };

        iocb.fire();
        self.follow_up(next);
        Ok(())
    }

    fn abort_io(&self, iocb: &Iocb<Req, Resp>, err: IocbError) {
        let (settled, next) = {
            let mut inner = self.inner.lock();
            let was_active = inner.is_active(iocb);
            if was_active {
                inner.active = None;
            }

            let settled = iocb.settle(Err(err));
            if settled {
                inner.aborted += 1;
            }

            let next = was_active.then(|| self.release(&mut inner));
            (settled, next)
        };

        if settled {
            iocb.fire();
        }
        if let Some(next) = next {
            self.follow_up(next);
        }
    }
}

impl<Req, Resp> Abortable for Controller<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    fn abort(&self, err: IocbError) {
        Controller::abort(self, err)
    }
}

impl<Req, Resp> std::fmt::Debug for Controller<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iocb::IocbState;
    use crate::scheduler::ThreadReactor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(2);

    fn context() -> IoContext {
        crate::test_support::init_tracing();
        IoContext::new(ThreadReactor::spawn("controller-test").unwrap())
    }

    /// Transport that hands every dispatched block to the test thread
    fn recording() -> (Arc<dyn Transport<u32, u32>>, mpsc::Receiver<Iocb<u32, u32>>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let transport = move |iocb: &Iocb<u32, u32>| -> IocbResult<()> {
            let _ = tx.lock().send(iocb.clone());
            Ok(())
        };
        (Arc::new(transport), rx)
    }

    #[test]
    fn test_idle_controller_dispatches_immediately() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let iocb = assert_ok!(controller.submit(10, 0));

        let sent = dispatched.recv_timeout(WAIT).unwrap();
        assert!(sent.ptr_eq(&iocb));
        assert_eq!(iocb.state(), IocbState::Active);
        assert_eq!(controller.state(), ControllerState::Active);

        assert_ok!(iocb.complete(11));
        assert_eq!(iocb.response(), Some(11));
    }

    #[test]
    fn test_priority_dispatch_order() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let first = controller.submit(0, 0).unwrap();
        assert!(dispatched.recv_timeout(WAIT).unwrap().ptr_eq(&first));

        let queued: Vec<_> = [3, 1, 2, 1]
            .iter()
            .map(|priority| controller.submit(*priority as u32, *priority).unwrap())
            .collect();
        assert_eq!(controller.queue().len(), 4);

        first.complete(0).unwrap();

        let mut order = Vec::new();
        for _ in 0..queued.len() {
            let iocb = dispatched.recv_timeout(WAIT).unwrap();
            order.push(iocb.id());
            iocb.complete(*iocb.request()).unwrap();
        }

        assert_eq!(
            order,
            vec![queued[1].id(), queued[3].id(), queued[2].id(), queued[0].id()]
        );
    }

    #[test]
    fn test_single_flight_under_concurrent_submitters() {
        let ctx = context();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let transport = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let scheduler = Arc::clone(ctx.scheduler());
            move |iocb: &Iocb<u32, u32>| -> IocbResult<()> {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let iocb = iocb.clone();
                let in_flight = Arc::clone(&in_flight);
                scheduler.schedule(
                    Duration::from_millis(1),
                    Box::new(move || {
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        let _ = iocb.complete(*iocb.request());
                    }),
                );
                Ok(())
            }
        };
        let transport: Arc<dyn Transport<u32, u32>> = Arc::new(transport);
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let submitters: Vec<_> = (0..4)
            .map(|t| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    (0..10)
                        .map(|i| controller.submit(t * 100 + i, 0).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let blocks: Vec<_> = submitters.into_iter().flat_map(|s| s.join().unwrap()).collect();
        for iocb in &blocks {
            assert!(iocb.wait(Some(WAIT)));
            assert_eq!(iocb.response(), Some(*iocb.request()));
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(controller.stats().completed, 40);
    }

    #[test]
    fn test_completion_of_non_active_block_is_protocol_violation() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let active = controller.submit(1, 0).unwrap();
        let queued = controller.submit(2, 0).unwrap();
        dispatched.recv_timeout(WAIT).unwrap();

        let result = queued.complete(2);
        assert!(matches!(result, Err(IocbError::ProtocolViolation(_))));
        assert_eq!(queued.state(), IocbState::Pending);
        assert_eq!(active.state(), IocbState::Active);
    }

    #[test]
    fn test_duplicate_response_is_ignored() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let iocb = controller.submit(1, 0).unwrap();
        dispatched.recv_timeout(WAIT).unwrap();

        assert_ok!(iocb.complete(1));
        assert_ok!(iocb.complete(2));
        assert_eq!(iocb.response(), Some(1));
        assert_eq!(controller.stats().completed, 1);
    }

    #[test]
    fn test_resubmitting_block_is_rejected() {
        let ctx = context();
        let (transport, _dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let iocb = controller.submit(1, 0).unwrap();
        let result = controller.request(iocb);
        assert_err!(result);
    }

    #[test]
    fn test_transport_error_aborts_and_continues() {
        let ctx = context();
        let transport: Arc<dyn Transport<u32, u32>> = Arc::new(|iocb: &Iocb<u32, u32>| -> IocbResult<()> {
            if *iocb.request() % 2 == 0 {
                Err(IocbError::transport("socket closed"))
            } else {
                iocb.complete(*iocb.request())
            }
        });
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let blocks: Vec<_> = (0..6).map(|i| controller.submit(i, 0).unwrap()).collect();
        for iocb in &blocks {
            assert!(iocb.wait(Some(WAIT)));
        }

        for iocb in &blocks {
            if *iocb.request() % 2 == 0 {
                assert_eq!(iocb.error(), Some(IocbError::transport("socket closed")));
            } else {
                assert_eq!(iocb.response(), Some(*iocb.request()));
            }
        }
    }

    #[test]
    fn test_long_burst_of_sync_failures() {
        let ctx = context();
        let transport: Arc<dyn Transport<u32, u32>> = Arc::new(|iocb: &Iocb<u32, u32>| -> IocbResult<()> {
            match *iocb.request() {
                0 => Ok(()),
                _ => Err(IocbError::transport("unreachable")),
            }
        });
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        // Block 0 holds the slot so the rest pile up in the queue
        let first = controller.submit(0, 0).unwrap();
        let blocks: Vec<_> = (1..=5000).map(|i| controller.submit(i, 0).unwrap()).collect();
        assert_eq!(controller.queue().len(), 5000);

        first.complete(0).unwrap();

        let last = blocks.last().unwrap();
        assert!(last.wait(Some(Duration::from_secs(10))));
        assert!(blocks.iter().all(|iocb| iocb.state() == IocbState::Aborted));
        assert_eq!(controller.stats().aborted, 5000);
    }

    #[test]
    fn test_block_aborted_before_dispatch_is_not_sent() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let iocb: Iocb<u32, u32> = ctx.iocb(1);
        let admitted = controller.admit(&iocb).unwrap().unwrap();
        iocb.abort(IocbError::aborted("cancelled"));
        controller.dispatch(admitted);

        assert!(dispatched.recv_timeout(Duration::from_millis(20)).is_err());
        assert_eq!(iocb.error(), Some(IocbError::aborted("cancelled")));
        assert!(controller.active().is_none());
    }

    #[test]
    fn test_abort_queued_block() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let active = controller.submit(1, 0).unwrap();
        let queued = controller.submit(2, 0).unwrap();
        dispatched.recv_timeout(WAIT).unwrap();

        queued.abort(IocbError::aborted("caller gave up"));

        assert_eq!(queued.error(), Some(IocbError::aborted("caller gave up")));
        assert!(controller.queue().is_empty());
        assert_eq!(controller.state(), ControllerState::Active);
        assert!(controller.active().unwrap().ptr_eq(&active));
    }

    #[test]
    fn test_controller_abort_drains_everything() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let blocks: Vec<_> = (0..3).map(|i| controller.submit(i, 0).unwrap()).collect();
        dispatched.recv_timeout(WAIT).unwrap();

        controller.abort(IocbError::aborted("link down"));

        for iocb in &blocks {
            assert_eq!(iocb.error(), Some(IocbError::aborted("link down")));
        }
        assert!(controller.queue().is_empty());
        assert!(controller.active().is_none());
    }

    #[test]
    fn test_abort_on_idle_controller_is_noop() {
        let ctx = context();
        let (transport, _dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        controller.abort(IocbError::aborted("nothing to do"));

        assert_eq!(controller.stats().aborted, 0);
        assert!(controller.is_quiescent());
    }

    #[test]
    fn test_context_abort_all_reaches_registered_controller() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());
        ctx.register(controller.name(), controller.clone()).unwrap();

        let blocks: Vec<_> = (0..2).map(|i| controller.submit(i, 0).unwrap()).collect();
        dispatched.recv_timeout(WAIT).unwrap();

        ctx.abort_all(IocbError::aborted("shutdown"));

        for iocb in &blocks {
            assert_eq!(iocb.error(), Some(IocbError::aborted("shutdown")));
        }
        assert_eq!(controller.stats().aborted, 2);
    }

    #[test]
    fn test_confirm_routes_to_active_block() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        assert!(!controller.confirm(Ok(1)));

        let first = controller.submit(1, 0).unwrap();
        let second = controller.submit(2, 0).unwrap();
        dispatched.recv_timeout(WAIT).unwrap();

        assert!(controller.confirm(Ok(100)));
        assert_eq!(first.response(), Some(100));

        dispatched.recv_timeout(WAIT).unwrap();
        assert!(controller.confirm(Err(IocbError::transport("reject"))));
        assert_eq!(second.error(), Some(IocbError::transport("reject")));
    }

    #[test]
    fn test_quiescent_delay_holds_next_dispatch() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let config = ControllerConfig {
            quiescent_delay_ms: 50,
            ..Default::default()
        };
        let controller = Controller::new(&ctx, "device-1", transport, config);

        let first = controller.submit(1, 0).unwrap();
        let _second = controller.submit(2, 0).unwrap();
        dispatched.recv_timeout(WAIT).unwrap();

        first.complete(1).unwrap();
        assert_eq!(controller.state(), ControllerState::Waiting);
        assert!(dispatched.recv_timeout(Duration::from_millis(20)).is_err());

        let next = dispatched.recv_timeout(WAIT).unwrap();
        assert_eq!(*next.request(), 2);
        assert_eq!(controller.state(), ControllerState::Active);
    }

    #[test]
    fn test_request_timeout_from_config() {
        let ctx = context();
        let (transport, dispatched) = recording();
        let config = ControllerConfig {
            request_timeout_ms: Some(20),
            ..Default::default()
        };
        let controller = Controller::new(&ctx, "device-1", transport, config);

        let silent = controller.submit(1, 0).unwrap();
        let next: Iocb<u32, u32> = ctx.iocb(2);
        controller.request(next.clone()).unwrap();
        dispatched.recv_timeout(WAIT).unwrap();

        assert!(silent.wait(Some(WAIT)));
        assert_eq!(silent.error(), Some(IocbError::Timeout));

        // The timeout freed the slot for the next request
        let sent = dispatched.recv_timeout(WAIT).unwrap();
        assert!(sent.ptr_eq(&next));
    }

    #[test]
    fn test_timeout_race_keeps_transport_result() {
        let ctx = context();
        let transport = {
            let scheduler = Arc::clone(ctx.scheduler());
            move |iocb: &Iocb<u32, u32>| -> IocbResult<()> {
                let iocb = iocb.clone();
                scheduler.schedule(
                    Duration::from_millis(10),
                    Box::new(move || {
                        let _ = iocb.complete(42);
                    }),
                );
                Ok(())
            }
        };
        let transport: Arc<dyn Transport<u32, u32>> = Arc::new(transport);
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let iocb: Iocb<u32, u32> = ctx.iocb(1);
        iocb.set_timeout(Duration::from_millis(50), IocbError::Timeout);
        controller.request(iocb.clone()).unwrap();

        assert!(iocb.wait(Some(WAIT)));
        thread::sleep(Duration::from_millis(80));

        assert_eq!(iocb.result(), Some(Ok(42)));
        assert_eq!(controller.stats().aborted, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_drives_queue() {
        crate::test_support::init_tracing();
        let ctx = IoContext::new(Arc::new(crate::scheduler::TokioScheduler::current().unwrap()));

        let transport: Arc<dyn Transport<u32, u32>> = Arc::new(|iocb: &Iocb<u32, u32>| -> IocbResult<()> {
            let iocb = iocb.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                let _ = iocb.complete(*iocb.request() * 2);
            });
            Ok(())
        });
        let controller = Controller::new(&ctx, "device-1", transport, ControllerConfig::default());

        let blocks: Vec<_> = (0..5).map(|i| controller.submit(i, 0).unwrap()).collect();
        for iocb in &blocks {
            tokio::time::timeout(WAIT, iocb.wait_async()).await.unwrap();
            assert_eq!(iocb.response(), Some(*iocb.request() * 2));
        }
        assert_eq!(controller.stats().dispatched, 5);
    }
}
