//! Concurrency substrate shared by the harvest pipeline and its satellite
//! tools: a single-consumer task serializer, a growable worker pool, reusable
//! object pools (bounded ones double as concurrency chokers), and the
//! periodic daemon contract.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

pub mod daemon;
pub mod pool;
pub mod resource;
pub mod serial;

pub use daemon::{Daemon, DaemonControl, DaemonHandle, DaemonRegistry, DaemonState};
pub use pool::WorkerPool;
pub use resource::{BoundedPool, Choker, PoolGuard, SerialPool, SyncPool, choker};
pub use serial::SerialQueue;

/// Failures surfaced by the execution primitives themselves. A task's own
/// error type travels inside its result value; these are about the queue.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("queue is closed")]
    Closed,
    #[error("task was cancelled")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Completion handle for a unit of work handed to a [`SerialQueue`], a
/// [`WorkerPool`] or a [`DaemonHandle`]. Resolves exactly once: with the
/// task's return value, or with an [`ExecError`] if the task never ran.
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<Result<R, ExecError>>,
}

impl<R> TaskHandle<R> {
    pub(crate) fn pair() -> (oneshot::Sender<Result<R, ExecError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub(crate) fn ready(result: Result<R, ExecError>) -> Self {
        let (tx, handle) = Self::pair();
        let _ = tx.send(result);
        handle
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, ExecError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Executor side torn down without resolving the task.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ExecError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
