//! Reusable object pools with a borrow/return discipline.
//!
//! Three flavors share one contract: `borrow` hands out an idle instance or
//! spawns a fresh one, and the guard puts it back on every exit path.
//! [`SyncPool`] guards its idle queue with a mutex, [`SerialPool`] funnels
//! queue mutation through a [`SerialQueue`], and [`BoundedPool`] adds a hard
//! capacity so that borrowing doubles as a concurrency permit — the pool the
//! pipeline uses to choke concurrent calls to a downstream dependency.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::ExecError;
use super::serial::SerialQueue;

type Spawner<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolCore<T> {
    idle: Mutex<VecDeque<T>>,
    spawn: Spawner<T>,
}

impl<T> PoolCore<T> {
    fn take_or_spawn(&self) -> T {
        let recycled = self.idle.lock().unwrap().pop_front();
        recycled.unwrap_or_else(|| (self.spawn)())
    }

    fn give_back(&self, instance: T) {
        self.idle.lock().unwrap().push_back(instance);
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// Scoped access to a pooled instance; returns it to the pool on drop. For
/// bounded pools the capacity permit is released only after the instance is
/// back in the idle queue.
pub struct PoolGuard<T> {
    core: Arc<PoolCore<T>>,
    instance: Option<T>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.instance.as_ref().expect("instance present until drop")
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.instance.as_mut().expect("instance present until drop")
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.core.give_back(instance);
        }
    }
}

/// Mutex-guarded pool: `borrow`/return are O(1) critical sections.
pub struct SyncPool<T> {
    core: Arc<PoolCore<T>>,
}

impl<T> Clone for SyncPool<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + 'static> SyncPool<T> {
    pub fn new(spawn: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            core: Arc::new(PoolCore {
                idle: Mutex::new(VecDeque::new()),
                spawn: Box::new(spawn),
            }),
        }
    }

    #[must_use]
    pub fn borrow(&self) -> PoolGuard<T> {
        PoolGuard {
            instance: Some(self.core.take_or_spawn()),
            core: Arc::clone(&self.core),
            _permit: None,
        }
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.core.idle_len()
    }
}

/// Pool whose idle-queue mutation is linearized through a [`SerialQueue`]
/// instead of a lock; `borrow` submits a task and awaits it.
pub struct SerialPool<T> {
    core: Arc<PoolCore<T>>,
    queue: SerialQueue,
}

/// Guard for [`SerialPool`]; the return trip is itself a serialized task.
pub struct SerialGuard<T: Send + 'static> {
    core: Arc<PoolCore<T>>,
    queue: SerialQueue,
    instance: Option<T>,
}

impl<T: Send + 'static> SerialPool<T> {
    pub fn new(spawn: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            core: Arc::new(PoolCore {
                idle: Mutex::new(VecDeque::new()),
                spawn: Box::new(spawn),
            }),
            queue: SerialQueue::new(),
        }
    }

    pub async fn borrow(&self) -> Result<SerialGuard<T>, ExecError> {
        let core = Arc::clone(&self.core);
        let instance = self.queue.submit(move || core.take_or_spawn()).await?;
        Ok(SerialGuard {
            core: Arc::clone(&self.core),
            queue: self.queue.clone(),
            instance: Some(instance),
        })
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.core.idle_len()
    }

    /// Run every pending borrow/return, then stop the backing serializer.
    pub async fn close(&self) {
        self.queue.flush().await;
    }
}

impl<T> Drop for SerialPool<T> {
    fn drop(&mut self) {
        self.queue.cancel_now();
    }
}

impl<T: Send + 'static> Deref for SerialGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.instance.as_ref().expect("instance present until drop")
    }
}

impl<T: Send + 'static> DerefMut for SerialGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.instance.as_mut().expect("instance present until drop")
    }
}

impl<T: Send + 'static> Drop for SerialGuard<T> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            let core = Arc::clone(&self.core);
            // Fire-and-forget; if the serializer is already closed the
            // instance is dropped here instead of rejoining the pool.
            drop(self.queue.submit(move || core.give_back(instance)));
        }
    }
}

/// Capacity-capped pool. `outstanding = borrowed + idle` never exceeds the
/// capacity, and a borrow issued at the cap suspends until a return frees a
/// slot — exactly one waiter resumes per return.
pub struct BoundedPool<T> {
    core: Arc<PoolCore<T>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl<T> Clone for BoundedPool<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            permits: Arc::clone(&self.permits),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> BoundedPool<T> {
    pub fn new(capacity: usize, spawn: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let capacity = capacity.max(1);
        Self {
            core: Arc::new(PoolCore {
                idle: Mutex::new(VecDeque::new()),
                spawn: Box::new(spawn),
            }),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn borrow(&self) -> PoolGuard<T> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("pool semaphore closed");
        PoolGuard {
            instance: Some(self.core.take_or_spawn()),
            core: Arc::clone(&self.core),
            _permit: Some(permit),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free; `capacity - available` instances are borrowed.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Two handles choke the same capacity iff they share one permit pool.
    #[must_use]
    pub fn shares_permits_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.permits, &other.permits)
    }
}

/// A bounded pool borrowed purely for its permit: the payload is a
/// placeholder, the capacity is the point.
pub type Choker = BoundedPool<()>;

#[must_use]
pub fn choker(capacity: usize) -> Choker {
    BoundedPool::new(capacity, || ())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn sync_pool_recycles_instances() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&spawned);
        let pool = SyncPool::new(move || counter.fetch_add(1, Ordering::SeqCst));

        {
            let first = pool.borrow();
            assert_eq!(*first, 0);
        }
        {
            let recycled = pool.borrow();
            assert_eq!(*recycled, 0, "returned instance is reused");
        }
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn serial_pool_recycles_through_the_serializer() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&spawned);
        let pool = SerialPool::new(move || counter.fetch_add(1, Ordering::SeqCst));

        let first = pool.borrow().await.expect("borrow succeeds");
        assert_eq!(*first, 0);
        drop(first);
        pool.close().await;

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.borrow().await, Err(ExecError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounded_pool_never_exceeds_capacity() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&spawned);
        let pool = BoundedPool::new(2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let order = Arc::new(Mutex::new(Vec::new()));
        let first = pool.borrow().await;
        let second = pool.borrow().await;
        assert_eq!(pool.available(), 0);

        let waiter_pool = pool.clone();
        let waiter_order = Arc::clone(&order);
        let waiter = tokio::spawn(async move {
            let _third = waiter_pool.borrow().await;
            waiter_order.lock().unwrap().push("third-borrowed");
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            order.lock().unwrap().is_empty(),
            "third borrow must block while two are outstanding"
        );

        order.lock().unwrap().push("first-returned");
        drop(first);
        waiter.await.expect("waiter finished");
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first-returned", "third-borrowed"]
        );

        drop(second);
        assert!(spawned.load(Ordering::SeqCst) <= 2, "capacity bounds spawns");
    }

    #[tokio::test]
    async fn choker_permits_are_the_payload() {
        let limiter = choker(1);
        let gate = limiter.borrow().await;
        assert_eq!(limiter.available(), 0);
        drop(gate);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn cloned_bounded_pools_share_their_permits() {
        let original = choker(3);
        let shared = original.clone();
        let independent = choker(3);

        assert!(original.shares_permits_with(&shared));
        assert!(!original.shares_permits_with(&independent));

        let _held = shared.borrow().await;
        assert_eq!(original.available(), 2);
    }
}
