//! I/O Context
//!
//! Holds the state shared by every block and controller of one application:
//! the block id sequence, the scheduler used for deferred work and timeouts,
//! and the registry of named controllers. Nothing lives in process globals,
//! so independent contexts can coexist in one process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::chain::IoChain;
use crate::error::{IocbError, IocbResult};
use crate::group::IoGroup;
use crate::iocb::{Completion, DEFAULT_PRIORITY, Iocb, IocbId};
use crate::scheduler::Scheduler;

/// Something that can abort all of its outstanding work
pub trait Abortable: Send + Sync {
    /// Abort every pending and active request with `err`
    fn abort(&self, err: IocbError);
}

struct ContextInner {
    next_id: AtomicU64,
    scheduler: Arc<dyn Scheduler>,
    controllers: DashMap<String, Arc<dyn Abortable>>,
}

/// Shared context for a transport or application
///
/// This is a lightweight, cloneable handle.
#[derive(Clone)]
pub struct IoContext {
    inner: Arc<ContextInner>,
}

impl IoContext {
    /// Create a context that defers work onto `scheduler`
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                next_id: AtomicU64::new(1),
                scheduler,
                controllers: DashMap::new(),
            }),
        }
    }

    /// Scheduler for deferred work and timers
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    /// Allocate the next block id
    pub(crate) fn next_id(&self) -> IocbId {
        IocbId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an idle block at the default priority
    pub fn iocb<Req, Resp>(&self, request: Req) -> Iocb<Req, Resp>
    where
        Req: Send + Sync + 'static,
        Resp: Clone + Send + Sync + 'static,
    {
        self.iocb_with_priority(request, DEFAULT_PRIORITY)
    }

    /// Create an idle block; lower priority values are serviced sooner
    pub fn iocb_with_priority<Req, Resp>(&self, request: Req, priority: i32) -> Iocb<Req, Resp>
    where
        Req: Send + Sync + 'static,
        Resp: Clone + Send + Sync + 'static,
    {
        Iocb::new(self.next_id(), request, priority, Arc::clone(&self.inner.scheduler))
    }

    /// Join `members` into a group that completes when all of them have
    pub fn group<I>(&self, members: I) -> IoGroup
    where
        I: IntoIterator<Item = Arc<dyn Completion>>,
    {
        IoGroup::new(self, members)
    }

    /// Chain `upstream` through a transformed downstream block
    pub fn chain<UReq, UResp, DReq, DResp, E, D>(
        &self,
        upstream: Iocb<UReq, UResp>,
        encode: E,
        decode: D,
    ) -> IocbResult<IoChain<UReq, UResp, DReq, DResp>>
    where
        UReq: Send + Sync + 'static,
        UResp: Clone + Send + Sync + 'static,
        DReq: Send + Sync + 'static,
        DResp: Clone + Send + Sync + 'static,
        E: FnOnce(&UReq) -> anyhow::Result<DReq>,
        D: FnOnce(DResp) -> anyhow::Result<UResp> + Send + 'static,
    {
        IoChain::new(self, upstream, encode, decode)
    }

    /// Register a named controller so `abort_all` reaches it
    pub fn register(&self, name: impl Into<String>, controller: Arc<dyn Abortable>) -> IocbResult<()> {
        let name = name.into();
        match self.inner.controllers.entry(name) {
            Entry::Occupied(entry) => Err(IocbError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!("Registered controller {}", entry.key());
                entry.insert(controller);
                Ok(())
            }
        }
    }

    /// Remove a named controller, returning whether it was registered
    pub fn unregister(&self, name: &str) -> bool {
        self.inner.controllers.remove(name).is_some()
    }

    /// Names of the registered controllers
    pub fn controller_names(&self) -> Vec<String> {
        self.inner
            .controllers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Abort everything, everywhere
    pub fn abort_all(&self, err: IocbError) {
        // Collect first so no shard lock is held while controllers run callbacks
        let controllers: Vec<Arc<dyn Abortable>> = self
            .inner
            .controllers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        tracing::info!("Aborting {} registered controllers: {}", controllers.len(), err);
        for controller in controllers {
            controller.abort(err.clone());
        }
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("next_id", &self.inner.next_id.load(Ordering::Relaxed))
            .field("controllers", &self.inner.controllers.len())
            .finish()
    }
}
