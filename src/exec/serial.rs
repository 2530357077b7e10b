//! Single-consumer task serializer.
//!
//! Arbitrary closures become linearized, awaitable operations: one dedicated
//! consumer task drains a FIFO queue in strict submission order, so two
//! submitted task bodies never interleave.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{ExecError, TaskHandle, panic_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Operating,
    Flushed,
    Cancelled,
}

enum Disposition {
    Run,
    Cancel,
}

struct Queued {
    resolve: Box<dyn FnOnce(Disposition) + Send>,
}

struct Inner {
    state: QueueState,
    queue: VecDeque<Queued>,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
}

/// A FIFO queue drained by exactly one dedicated consumer task.
///
/// `Operating` is the only state that accepts submissions; leaving it is
/// terminal. [`SerialQueue::flush`] executes everything already queued before
/// stopping, [`SerialQueue::cancel`] fails everything still queued. A task's
/// panic is captured into its own handle and never stops the consumer.
#[derive(Clone)]
pub struct SerialQueue {
    shared: Arc<Shared>,
    consumer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SerialQueue {
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: QueueState::Operating,
                queue: VecDeque::new(),
            }),
            wake: Notify::new(),
        });
        let consumer = tokio::spawn(Self::drain(Arc::clone(&shared)));
        Self {
            shared,
            consumer: Arc::new(Mutex::new(Some(consumer))),
        }
    }

    /// Queue a closure for execution, in submission order, on the consumer
    /// task. Fails fast with [`ExecError::Closed`] once the queue has been
    /// flushed or cancelled.
    pub fn submit<R, F>(&self, operation: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, handle) = TaskHandle::pair();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != QueueState::Operating {
                return TaskHandle::ready(Err(ExecError::Closed));
            }
            inner.queue.push_back(Queued {
                resolve: Box::new(move |disposition| match disposition {
                    Disposition::Run => {
                        let result = catch_unwind(AssertUnwindSafe(operation));
                        let _ = tx.send(result.map_err(|payload| {
                            ExecError::Panicked(panic_message(payload.as_ref()))
                        }));
                    }
                    Disposition::Cancel => {
                        let _ = tx.send(Err(ExecError::Cancelled));
                    }
                }),
            });
        }
        self.shared.wake.notify_one();
        handle
    }

    /// True while submissions are still accepted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.inner.lock().unwrap().state == QueueState::Operating
    }

    /// Execute every task already queued, then stop accepting. Returns once
    /// the consumer has exited.
    pub async fn flush(&self) {
        self.close(QueueState::Flushed).await;
    }

    /// Stop accepting, fail every still-queued task with
    /// [`ExecError::Cancelled`] and let only the in-flight task finish.
    pub async fn cancel(&self) {
        self.close(QueueState::Cancelled).await;
    }

    /// Signal cancellation without waiting for the consumer to exit. Intended
    /// for `Drop` paths that cannot await.
    pub fn cancel_now(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == QueueState::Operating {
            inner.state = QueueState::Cancelled;
        }
        drop(inner);
        self.shared.wake.notify_one();
    }

    async fn close(&self, target: QueueState) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == QueueState::Operating {
                inner.state = target;
            }
        }
        self.shared.wake.notify_one();
        let consumer = self.consumer.lock().unwrap().take();
        if let Some(handle) = consumer {
            let _ = handle.await;
        }
    }

    async fn drain(shared: Arc<Shared>) {
        enum Step {
            Run(Queued),
            Wait,
            Exit,
        }

        loop {
            let step = {
                let mut inner = shared.inner.lock().unwrap();
                match inner.state {
                    QueueState::Operating => inner.queue.pop_front().map_or(Step::Wait, Step::Run),
                    QueueState::Flushed => inner.queue.pop_front().map_or(Step::Exit, Step::Run),
                    QueueState::Cancelled => {
                        let orphaned: Vec<Queued> = inner.queue.drain(..).collect();
                        drop(inner);
                        for task in orphaned {
                            (task.resolve)(Disposition::Cancel);
                        }
                        Step::Exit
                    }
                }
            };
            match step {
                Step::Run(task) => (task.resolve)(Disposition::Run),
                Step::Wait => shared.wake.notified().await,
                Step::Exit => return,
            }
        }
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}
