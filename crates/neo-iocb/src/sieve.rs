//! Per-Key Controller Sieve
//!
//! Serializes requests per destination while letting different destinations
//! run concurrently. Each key gets its own `Controller`, created on first use
//! and dropped again once it has nothing in flight and nothing queued.
//!
//! Admission into a key's controller happens while the map entry is locked,
//! and eviction goes through the same shard lock, so a block can never be
//! handed to a controller that is about to be evicted.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::config::ControllerConfig;
use crate::context::{Abortable, IoContext};
use crate::controller::{Controller, IdleHook, Transport};
use crate::error::{IocbError, IocbResult};
use crate::iocb::{Iocb, Outcome};

/// Transport for a sieve, told which key a block was submitted under
pub trait KeyedTransport<K, Req, Resp>: Send + Sync + 'static {
    fn process(&self, key: &K, iocb: &Iocb<Req, Resp>) -> IocbResult<()>;
}

impl<K, Req, Resp, F> KeyedTransport<K, Req, Resp> for F
where
    F: Fn(&K, &Iocb<Req, Resp>) -> IocbResult<()> + Send + Sync + 'static,
{
    fn process(&self, key: &K, iocb: &Iocb<Req, Resp>) -> IocbResult<()> {
        self(key, iocb)
    }
}

/// Binds a keyed transport to one key
struct KeyTransport<K, Req, Resp> {
    key: K,
    transport: Arc<dyn KeyedTransport<K, Req, Resp>>,
}

impl<K, Req, Resp> Transport<Req, Resp> for KeyTransport<K, Req, Resp>
where
    K: Send + Sync + 'static,
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    fn process(&self, iocb: &Iocb<Req, Resp>) -> IocbResult<()> {
        self.transport.process(&self.key, iocb)
    }
}

type ControllerMap<K, Req, Resp> = DashMap<K, Arc<Controller<Req, Resp>>>;

/// One serializing controller per key
pub struct SieveController<K, Req, Resp> {
    name: String,
    ctx: IoContext,
    transport: Arc<dyn KeyedTransport<K, Req, Resp>>,
    config: ControllerConfig,
    controllers: Arc<ControllerMap<K, Req, Resp>>,
}

impl<K, Req, Resp> SieveController<K, Req, Resp>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    pub fn new(
        ctx: &IoContext,
        name: impl Into<String>,
        transport: Arc<dyn KeyedTransport<K, Req, Resp>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            ctx: ctx.clone(),
            transport,
            config,
            controllers: Arc::new(DashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a block for `request` and submit it under `key`
    pub fn submit(&self, key: K, request: Req, priority: i32) -> IocbResult<Iocb<Req, Resp>> {
        let iocb = self.ctx.iocb_with_priority(request, priority);
        if let Some(timeout) = self.config.request_timeout() {
            iocb.set_timeout(timeout, IocbError::Timeout);
        }
        self.request(key, iocb.clone())?;
        Ok(iocb)
    }

    /// Submit an idle block to the controller for `key`, creating it if
    /// needed
    pub fn request(&self, key: K, iocb: Iocb<Req, Resp>) -> IocbResult<()> {
        let (controller, admitted) = {
            let entry = self
                .controllers
                .entry(key.clone())
                .or_insert_with(|| self.spawn_controller(&key));
            let controller = Arc::clone(entry.value());
            let admitted = controller.admit(&iocb);
            (controller, admitted)
        };

        match admitted {
            Ok(Some(iocb)) => {
                controller.dispatch(iocb);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                // A controller created just for a rejected block would linger
                evict(&*self.controllers, &key, &*controller);
                Err(err)
            }
        }
    }

    /// Deliver a response or error to the active block for `key`.
    ///
    /// Returns false if no controller exists for `key` or nothing is active.
    pub fn confirm(&self, key: &K, outcome: Outcome<Resp>) -> bool {
        let Some(controller) = self.controller(key) else {
            tracing::debug!("{} has no controller for {:?}", self.name, key);
            return false;
        };
        controller.confirm(outcome)
    }

    /// Controller currently serving `key`
    pub fn controller(&self, key: &K) -> Option<Arc<Controller<Req, Resp>>> {
        self.controllers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Keys with a live controller
    pub fn keys(&self) -> Vec<K> {
        self.controllers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Abort everything in flight or queued under every key
    pub fn abort(&self, err: IocbError) {
        let controllers: Vec<_> = self
            .controllers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        tracing::debug!("{} aborting {} keys: {}", self.name, controllers.len(), err);
        for controller in controllers {
            controller.abort(err.clone());
        }
    }

    fn spawn_controller(&self, key: &K) -> Arc<Controller<Req, Resp>> {
        tracing::debug!("{} new controller for {:?}", self.name, key);

        let map: Weak<ControllerMap<K, Req, Resp>> = Arc::downgrade(&self.controllers);
        let evict_key = key.clone();
        let hook: IdleHook<Req, Resp> = Box::new(move |controller| {
            if let Some(map) = map.upgrade() {
                evict(&*map, &evict_key, controller);
            }
        });

        let transport = Arc::new(KeyTransport {
            key: key.clone(),
            transport: Arc::clone(&self.transport),
        });

        Controller::build(
            &self.ctx,
            format!("{}[{:?}]", self.name, key),
            transport,
            self.config.clone(),
            Some(hook),
        )
    }
}

/// Drop the entry for `key` if it still maps to `controller` and that
/// controller is quiescent
fn evict<K, Req, Resp>(map: &ControllerMap<K, Req, Resp>, key: &K, controller: &Controller<Req, Resp>)
where
    K: Eq + Hash + Debug,
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    let removed = map.remove_if(key, |_, current| {
        std::ptr::eq(Arc::as_ptr(current), controller) && current.is_quiescent()
    });
    if removed.is_some() {
        tracing::debug!("Evicted idle controller for {:?}", key);
    }
}

impl<K, Req, Resp> Abortable for SieveController<K, Req, Resp>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    fn abort(&self, err: IocbError) {
        SieveController::abort(self, err)
    }
}

impl<K, Req, Resp> std::fmt::Debug for SieveController<K, Req, Resp>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SieveController")
            .field("name", &self.name)
            .field("keys", &self.controllers.len())
            .finish()
    }
}
