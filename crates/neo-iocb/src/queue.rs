//! Priority queue of control blocks
//!
//! Blocks are kept in ascending priority order (lower value is serviced
//! sooner); blocks of equal priority keep their submission order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{IocbError, IocbResult};
use crate::iocb::{Iocb, IocbId, IocbState};

pub(crate) struct QueueInner<Req, Resp> {
    name: String,
    items: Mutex<Vec<Iocb<Req, Resp>>>,
    not_empty: Condvar,
}

impl<Req, Resp> QueueInner<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    /// Remove a block by id, returning whether it was queued
    pub(crate) fn remove(&self, id: IocbId) -> bool {
        let mut items = self.items.lock();
        match items.iter().position(|queued| queued.id() == id) {
            Some(index) => {
                items.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Ordered holding area for blocks awaiting a controller
pub struct IoQueue<Req, Resp> {
    inner: Arc<QueueInner<Req, Resp>>,
}

impl<Req, Resp> Clone for IoQueue<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req, Resp> IoQueue<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                items: Mutex::new(Vec::new()),
                not_empty: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a pending block behind every queued block of the same or lower
    /// priority value.
    ///
    /// Returns true if the queue was empty before this call.
    pub fn put(&self, iocb: &Iocb<Req, Resp>) -> IocbResult<bool> {
        let state = iocb.state();
        if state != IocbState::Pending {
            return Err(IocbError::InvalidState(format!(
                "cannot queue iocb {} in state {}",
                iocb.id(),
                state
            )));
        }

        let was_empty = {
            let mut items = self.inner.items.lock();
            let was_empty = items.is_empty();
            let index = items.partition_point(|queued| queued.priority() <= iocb.priority());
            items.insert(index, iocb.clone());
            iocb.set_queue(Some(Arc::downgrade(&self.inner)));
            was_empty
        };

        self.inner.not_empty.notify_one();
        tracing::trace!("Queued iocb {} on {} (empty before: {})", iocb.id(), self.inner.name, was_empty);
        Ok(was_empty)
    }

    /// Take the head of the queue.
    ///
    /// With `block` false an empty queue returns `None` at once. Otherwise
    /// waits for a block to arrive, indefinitely or up to `delay`.
    pub fn get(&self, block: bool, delay: Option<Duration>) -> Option<Iocb<Req, Resp>> {
        let mut items = self.inner.items.lock();

        if items.is_empty() {
            if !block {
                return None;
            }
            match delay.and_then(|delay| Instant::now().checked_add(delay)) {
                Some(deadline) => {
                    while items.is_empty() {
                        if self.inner.not_empty.wait_until(&mut items, deadline).timed_out() {
                            break;
                        }
                    }
                    if items.is_empty() {
                        return None;
                    }
                }
                None => {
                    while items.is_empty() {
                        self.inner.not_empty.wait(&mut items);
                    }
                }
            }
        }

        let iocb = items.remove(0);
        drop(items);

        iocb.set_queue(None);
        Some(iocb)
    }

    /// Remove a specific block; a no-op if it is not queued here
    pub fn remove(&self, iocb: &Iocb<Req, Resp>) -> bool {
        let removed = self.inner.remove(iocb.id());
        if removed {
            iocb.set_queue(None);
        }
        removed
    }

    /// Abort every queued block with `err`, leaving the queue empty
    pub fn abort_all(&self, err: IocbError) {
        let drained = std::mem::take(&mut *self.inner.items.lock());
        if !drained.is_empty() {
            tracing::debug!("Aborting {} queued iocbs on {}: {}", drained.len(), self.inner.name, err);
        }

        for iocb in drained {
            iocb.set_queue(None);
            iocb.abort(err.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// Ids in service order
    pub fn ids(&self) -> Vec<IocbId> {
        self.inner.items.lock().iter().map(Iocb::id).collect()
    }
}

impl<Req, Resp> std::fmt::Debug for IoQueue<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoQueue")
            .field("name", &self.inner.name)
            .field("len", &self.inner.items.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IoContext;
    use crate::scheduler::ThreadReactor;
    use std::thread;

    fn context() -> IoContext {
        IoContext::new(ThreadReactor::spawn("queue-test").unwrap())
    }

    fn pending(ctx: &IoContext, priority: i32) -> Iocb<u32, u32> {
        let iocb = ctx.iocb_with_priority(priority as u32, priority);
        iocb.mark_pending();
        iocb
    }

    #[test]
    fn test_priority_order_is_fifo_within_tier() {
        let ctx = context();
        let queue = IoQueue::new("device-1");
        let blocks: Vec<_> = [3, 1, 2, 1].iter().map(|p| pending(&ctx, *p)).collect();

        assert!(queue.put(&blocks[0]).unwrap());
        for iocb in &blocks[1..] {
            assert!(!queue.put(iocb).unwrap());
        }

        let order: Vec<_> = std::iter::from_fn(|| queue.get(false, None))
            .map(|iocb| iocb.id())
            .collect();
        assert_eq!(
            order,
            vec![blocks[1].id(), blocks[3].id(), blocks[2].id(), blocks[0].id()]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_put_requires_pending() {
        let ctx = context();
        let queue = IoQueue::new("device-1");
        let iocb: Iocb<u32, u32> = ctx.iocb(1);

        let result = queue.put(&iocb);
        assert!(matches!(result, Err(IocbError::InvalidState(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_get_on_empty_queue() {
        let queue: IoQueue<u32, u32> = IoQueue::new("empty");

        assert!(queue.get(false, None).is_none());
        assert!(queue.get(true, Some(Duration::from_millis(20))).is_none());
    }

    #[test]
    fn test_blocking_get_wakes_on_put() {
        let ctx = context();
        let queue = IoQueue::new("device-1");
        let iocb = pending(&ctx, 0);

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get(true, None).map(|iocb| iocb.id()))
        };

        thread::sleep(Duration::from_millis(20));
        queue.put(&iocb).unwrap();

        assert_eq!(consumer.join().unwrap(), Some(iocb.id()));
    }

    #[test]
    fn test_blocking_get_with_unbounded_delay() {
        let ctx = context();
        let queue = IoQueue::new("device-1");
        let iocb = pending(&ctx, 0);

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get(true, Some(Duration::MAX)).map(|iocb| iocb.id()))
        };

        thread::sleep(Duration::from_millis(20));
        queue.put(&iocb).unwrap();

        assert_eq!(consumer.join().unwrap(), Some(iocb.id()));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let ctx = context();
        let queue = IoQueue::new("device-1");
        let first = pending(&ctx, 0);
        let second = pending(&ctx, 0);
        queue.put(&first).unwrap();
        queue.put(&second).unwrap();

        assert!(queue.remove(&first));
        assert!(!queue.remove(&first));
        assert_eq!(queue.ids(), vec![second.id()]);
    }

    #[test]
    fn test_aborted_block_leaves_queue() {
        let ctx = context();
        let queue = IoQueue::new("device-1");
        let iocb = pending(&ctx, 0);
        queue.put(&iocb).unwrap();

        iocb.abort(IocbError::aborted("cancelled"));

        assert!(queue.is_empty());
        assert_eq!(iocb.state(), IocbState::Aborted);
    }

    #[test]
    fn test_abort_all_drains_queue() {
        let ctx = context();
        let queue = IoQueue::new("device-1");
        let blocks: Vec<_> = (0..3).map(|p| pending(&ctx, p)).collect();
        for iocb in &blocks {
            queue.put(iocb).unwrap();
        }

        queue.abort_all(IocbError::aborted("link down"));

        assert!(queue.is_empty());
        for iocb in &blocks {
            assert_eq!(iocb.error(), Some(IocbError::aborted("link down")));
        }
    }
}
