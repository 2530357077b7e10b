//! Shared-queue worker pool with dynamic growth and cooperative shrink.
//!
//! Shrinking posts termination credits; whichever workers next find
//! themselves without work consume one credit each and exit, so a
//! shrink-by-k removes exactly k workers over time. `active_count` stays
//! precise under the queue lock, which is what makes the idle-barrier
//! pattern (poll until zero) sound even for batches that enqueue further
//! tasks from inside a task.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::{ExecError, TaskHandle, panic_message};

enum Disposition {
    Run,
    Cancel,
}

struct Queued {
    resolve: Box<dyn FnOnce(Disposition) -> Option<BoxFuture<'static, ()>> + Send>,
}

struct Inner {
    queue: VecDeque<Queued>,
    termination_credits: usize,
    stopping: bool,
    closed: bool,
    active: usize,
    workers: HashMap<u64, JoinHandle<()>>,
    next_worker_id: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    // Wake tokens, one per queued task / termination credit / stop signal.
    wake: Semaphore,
}

/// N workers draining one shared FIFO queue.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(initial_workers: usize) -> Self {
        let pool = Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    termination_credits: 0,
                    stopping: false,
                    closed: false,
                    active: 0,
                    workers: HashMap::new(),
                    next_worker_id: 1,
                }),
                wake: Semaphore::new(0),
            }),
        };
        // A pool that cannot run anything is useless even as a stub.
        let _ = pool.grow(initial_workers.max(1));
        pool
    }

    /// Queue a future for execution by any worker. No ordering is guaranteed
    /// between concurrently queued tasks. A panic inside the task resolves
    /// only this task's handle.
    pub fn enqueue<F>(&self, task: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, handle) = TaskHandle::pair();
        let resolve = Box::new(move |disposition: Disposition| match disposition {
            Disposition::Run => Some(
                async move {
                    let result = AssertUnwindSafe(task).catch_unwind().await;
                    let _ = tx.send(result.map_err(|payload| {
                        ExecError::Panicked(panic_message(payload.as_ref()))
                    }));
                }
                .boxed(),
            ),
            Disposition::Cancel => {
                let _ = tx.send(Err(ExecError::Cancelled));
                None
            }
        });
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.closed {
                return TaskHandle::ready(Err(ExecError::Closed));
            }
            inner.queue.push_back(Queued { resolve });
        }
        self.shared.wake.add_permits(1);
        handle
    }

    /// Spawn `count` additional workers.
    pub fn grow(&self, count: usize) -> Result<(), ExecError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.closed {
            return Err(ExecError::Closed);
        }
        for _ in 0..count {
            let id = inner.next_worker_id;
            inner.next_worker_id += 1;
            // Workers count as active from spawn until their first wait, so
            // the idle barrier cannot observe a spurious zero mid-startup.
            inner.active += 1;
            let worker = tokio::spawn(Self::work(Arc::clone(&self.shared), id));
            inner.workers.insert(id, worker);
        }
        Ok(())
    }

    /// Retire `count` workers, one per worker that next finds the queue
    /// empty. No-op while an earlier shrink is still pending.
    pub fn shrink(&self, count: usize) {
        let credits = {
            let mut inner = self.shared.inner.lock().unwrap();
            if count == 0 || inner.termination_credits > 0 {
                return;
            }
            let credits = count.min(inner.workers.len());
            inner.termination_credits = credits;
            credits
        };
        self.shared.wake.add_permits(credits);
    }

    /// Workers currently executing a task (not idle-waiting).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.inner.lock().unwrap().active
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.inner.lock().unwrap().workers.len()
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.shared.inner.lock().unwrap().queue.len()
    }

    /// No task running and none queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.active == 0 && inner.queue.is_empty()
    }

    /// Signal every worker to terminate after its current task, optionally
    /// cancelling queued-but-unstarted tasks, then wait for all workers to
    /// exit. The pool rejects submissions afterwards.
    pub async fn stop_all(&self, cancel_queued: bool) {
        let (cancelled, workers) = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.stopping = true;
            inner.closed = true;
            let cancelled: Vec<Queued> = if cancel_queued {
                inner.queue.drain(..).collect()
            } else {
                Vec::new()
            };
            let workers: Vec<JoinHandle<()>> =
                inner.workers.drain().map(|(_, handle)| handle).collect();
            (cancelled, workers)
        };
        for task in cancelled {
            let _ = (task.resolve)(Disposition::Cancel);
        }
        self.shared.wake.add_permits(workers.len().max(1));
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn work(shared: Arc<Shared>, id: u64) {
        enum Step {
            Run(Queued),
            Wait,
            Exit,
        }

        let mut counted = true;
        loop {
            let step = {
                let mut inner = shared.inner.lock().unwrap();
                if inner.stopping {
                    if counted {
                        inner.active -= 1;
                    }
                    inner.workers.remove(&id);
                    Step::Exit
                } else if let Some(task) = inner.queue.pop_front() {
                    if !counted {
                        inner.active += 1;
                        counted = true;
                    }
                    Step::Run(task)
                } else if inner.termination_credits > 0 {
                    inner.termination_credits -= 1;
                    if counted {
                        inner.active -= 1;
                    }
                    inner.workers.remove(&id);
                    Step::Exit
                } else {
                    if counted {
                        inner.active -= 1;
                        counted = false;
                    }
                    Step::Wait
                }
            };
            match step {
                Step::Run(task) => {
                    if let Some(job) = (task.resolve)(Disposition::Run) {
                        job.await;
                    }
                }
                Step::Wait => {
                    if let Ok(permit) = shared.wake.acquire().await {
                        permit.forget();
                    } else {
                        return;
                    }
                }
                Step::Exit => return,
            }
        }
    }
}
