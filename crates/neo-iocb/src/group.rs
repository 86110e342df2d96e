//! Completion Groups
//!
//! An `IoGroup` finishes once every member has finished. Members are joined
//! as `Completion` trait objects, so blocks of different types and other
//! groups can be mixed freely.
//!
//! A group completes successfully even when some of its members were aborted;
//! inspect the members for their individual results. Aborting the group
//! aborts every unfinished member and finishes the group with that error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::IoContext;
use crate::error::{IocbError, IocbResult};
use crate::iocb::{Completion, Iocb, IocbId, IocbState, Outcome};

struct GroupInner {
    block: Iocb<(), ()>,
    members: Mutex<Vec<Arc<dyn Completion>>>,
    /// Set once the initial members are attached
    armed: AtomicBool,
    /// Suppresses completion while an abort cascades through the members
    aborting: AtomicBool,
}

impl GroupInner {
    /// Complete the group if every member has finished.
    ///
    /// The check and the settle happen under the members lock, so a member
    /// joining through `add` either lands before the check or sees the group
    /// already finished.
    fn evaluate(&self) {
        if !self.armed.load(Ordering::SeqCst) || self.aborting.load(Ordering::SeqCst) {
            return;
        }

        let settled = {
            let members = self.members.lock();
            members.iter().all(|member| member.is_terminal()) && self.block.settle(Ok(()))
        };
        if settled {
            tracing::trace!("Group {} complete", self.block.id());
            self.block.fire();
        }
    }
}

/// Block that completes when all of its members have
#[derive(Clone)]
pub struct IoGroup {
    inner: Arc<GroupInner>,
}

impl IoGroup {
    pub(crate) fn new<I>(ctx: &IoContext, members: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Completion>>,
    {
        let group = Self {
            inner: Arc::new(GroupInner {
                block: ctx.iocb(()),
                members: Mutex::new(Vec::new()),
                armed: AtomicBool::new(false),
                aborting: AtomicBool::new(false),
            }),
        };

        for member in members {
            group.attach(member);
        }

        // An empty group, or one whose members all finished already,
        // completes here
        group.inner.armed.store(true, Ordering::SeqCst);
        group.inner.evaluate();
        group
    }

    /// Join another member. Fails once the group has finished.
    pub fn add(&self, member: Arc<dyn Completion>) -> IocbResult<()> {
        {
            let mut members = self.inner.members.lock();
            let state = self.state();
            if state.is_terminal() {
                return Err(IocbError::InvalidState(format!(
                    "group {} is {}, cannot add iocb {}",
                    self.id(),
                    state,
                    member.id()
                )));
            }
            members.push(Arc::clone(&member));
        }
        self.watch(member);
        Ok(())
    }

    fn attach(&self, member: Arc<dyn Completion>) {
        self.inner.members.lock().push(Arc::clone(&member));
        self.watch(member);
    }

    /// Re-evaluate the group whenever `member` finishes
    fn watch(&self, member: Arc<dyn Completion>) {
        let weak = Arc::downgrade(&self.inner);
        member.on_terminal(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.evaluate();
            }
        }));
    }

    pub fn id(&self) -> IocbId {
        self.inner.block.id()
    }

    pub fn state(&self) -> IocbState {
        self.inner.block.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.block.is_terminal()
    }

    /// `Ok(())` once all members finished, or the abort error
    pub fn result(&self) -> Option<Outcome<()>> {
        self.inner.block.result()
    }

    /// Number of members joined so far
    pub fn len(&self) -> usize {
        self.inner.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.inner.block.wait(timeout)
    }

    pub async fn wait_async(&self) {
        self.inner.block.wait_async().await
    }

    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<()>) + Send + 'static,
    {
        self.inner.block.add_callback(callback)
    }

    /// Abort every unfinished member, then finish the group with `err`
    pub fn abort(&self, err: IocbError) {
        if self.is_terminal() {
            return;
        }

        self.inner.aborting.store(true, Ordering::SeqCst);
        let members = self.inner.members.lock().clone();
        tracing::debug!("Aborting group {} ({} members): {}", self.id(), members.len(), err);

        for member in members.iter().filter(|member| !member.is_terminal()) {
            member.abort(err.clone());
        }
        self.inner.block.resolve(Err(err));
    }

    /// Type-erased handle, for nesting into another group
    pub fn as_completion(&self) -> Arc<dyn Completion> {
        Arc::new(self.clone())
    }
}

impl Completion for IoGroup {
    fn id(&self) -> IocbId {
        IoGroup::id(self)
    }

    fn is_terminal(&self) -> bool {
        IoGroup::is_terminal(self)
    }

    fn abort(&self, err: IocbError) {
        IoGroup::abort(self, err)
    }

    fn on_terminal(&self, f: Box<dyn FnOnce() + Send + 'static>) {
        self.add_callback(move |_| f());
    }
}

impl std::fmt::Debug for IoGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoGroup")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("members", &self.len())
            .finish()
    }
}
