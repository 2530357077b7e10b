//! Periodic-iteration daemon contract.
//!
//! A daemon's state is owned by a single actor task: the tick loop and every
//! externally dispatched operation travel through one channel, so no
//! user-triggered mutation ever runs concurrently with an in-flight
//! iteration. Long-running work belongs in tasks the daemon spawns and
//! tracks, never inside `iterate` itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{ExecError, TaskHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// The single overridable hook: one scheduler tick. Returning `false` stops
/// the loop.
#[async_trait]
pub trait Daemon: Send + 'static {
    async fn iterate(&mut self) -> bool;
}

enum Command<D> {
    Dispatch(Box<dyn FnOnce(&mut D) + Send>),
    Stop,
}

/// Externally held handle to a running daemon actor.
pub struct DaemonHandle<D> {
    commands: mpsc::UnboundedSender<Command<D>>,
    state: watch::Receiver<DaemonState>,
    loop_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<D> Clone for DaemonHandle<D> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
            loop_task: Arc::clone(&self.loop_task),
        }
    }
}

/// Start the daemon's actor loop with a fixed tick interval.
pub fn spawn<D: Daemon>(mut daemon: D, tick: Duration) -> DaemonHandle<D> {
    let (commands, mut rx) = mpsc::unbounded_channel::<Command<D>>();
    let (state_tx, state_rx) = watch::channel(DaemonState::Idle);

    let loop_task = tokio::spawn(async move {
        let _ = state_tx.send(DaemonState::Running);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                command = rx.recv() => match command {
                    Some(Command::Dispatch(operation)) => operation(&mut daemon),
                    Some(Command::Stop) | None => break,
                },
                _ = ticker.tick() => {
                    if !daemon.iterate().await {
                        break;
                    }
                }
            }
        }
        let _ = state_tx.send(DaemonState::Stopping);
        rx.close();
        // Anything still queued resolves as cancelled when its closure drops.
        while rx.try_recv().is_ok() {}
        let _ = state_tx.send(DaemonState::Stopped);
    });

    DaemonHandle {
        commands,
        state: state_rx,
        loop_task: Arc::new(Mutex::new(Some(loop_task))),
    }
}

impl<D: Daemon> DaemonHandle<D> {
    /// Run a state mutation on the daemon's own actor task, serialized with
    /// the tick loop. Fails with [`ExecError::Closed`] once the daemon is
    /// stopping.
    pub fn dispatch<R, F>(&self, operation: F) -> TaskHandle<R>
    where
        F: FnOnce(&mut D) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, handle) = TaskHandle::pair();
        let wrapped = Box::new(move |daemon: &mut D| {
            let _ = tx.send(Ok(operation(daemon)));
        });
        if self.commands.send(Command::Dispatch(wrapped)).is_err() {
            return TaskHandle::ready(Err(ExecError::Closed));
        }
        handle
    }

    #[must_use]
    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    /// Request the loop to stop after the in-flight tick or command.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Stop and wait for the actor to exit. Idempotent and safe to call from
    /// several tasks at once; late callers wait on the state machine instead
    /// of the join handle.
    pub async fn close(&self) {
        self.stop();
        let pending = self.loop_task.lock().unwrap().take();
        if let Some(task) = pending {
            let _ = task.await;
        } else {
            let mut state = self.state.clone();
            while *state.borrow() != DaemonState::Stopped {
                if state.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Narrow shutdown capability, so heterogeneous daemons fit one registry.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    async fn shutdown(&self);
}

#[async_trait]
impl<D: Daemon> DaemonControl for DaemonHandle<D> {
    async fn shutdown(&self) {
        self.close().await;
    }
}

/// Explicitly constructed replacement for a process-global daemon manager:
/// built at startup, handed to whatever needs to stop daemons, drained once
/// on shutdown.
#[derive(Default)]
pub struct DaemonRegistry {
    entries: Mutex<Vec<(String, Box<dyn DaemonControl>)>>,
}

impl DaemonRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a daemon under a unique name; returns false on a duplicate.
    pub fn manage(&self, name: &str, daemon: Box<dyn DaemonControl>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|(existing, _)| existing == name) {
            return false;
        }
        entries.push((name.to_string(), daemon));
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Close every registered daemon, in registration order.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Box<dyn DaemonControl>)> =
            { self.entries.lock().unwrap().drain(..).collect() };
        for (name, daemon) in drained {
            tracing::info!(daemon = %name, "closing daemon");
            daemon.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        ticks: Arc<AtomicUsize>,
        budget: usize,
        notes: Vec<&'static str>,
    }

    #[async_trait]
    impl Daemon for Counting {
        async fn iterate(&mut self) -> bool {
            let seen = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            seen < self.budget
        }
    }

    #[tokio::test]
    async fn iterates_until_the_hook_declines() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = spawn(
            Counting {
                ticks: Arc::clone(&ticks),
                budget: 3,
                notes: Vec::new(),
            },
            Duration::from_millis(5),
        );

        handle.close().await;
        assert_eq!(handle.state(), DaemonState::Stopped);
        assert!(ticks.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn dispatched_operations_are_serialized_with_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = spawn(
            Counting {
                ticks,
                budget: usize::MAX,
                notes: Vec::new(),
            },
            Duration::from_millis(5),
        );

        handle
            .dispatch(|daemon| daemon.notes.push("first"))
            .await
            .expect("dispatch runs");
        let notes = handle
            .dispatch(|daemon| {
                daemon.notes.push("second");
                daemon.notes.clone()
            })
            .await
            .expect("dispatch observes earlier mutation");

        assert_eq!(notes, vec!["first", "second"]);
        handle.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_safe_concurrently() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = spawn(
            Counting {
                ticks,
                budget: usize::MAX,
                notes: Vec::new(),
            },
            Duration::from_millis(5),
        );

        let other = handle.clone();
        let racing = tokio::spawn(async move { other.close().await });
        handle.close().await;
        racing.await.expect("concurrent close finished");
        handle.close().await;

        assert_eq!(handle.state(), DaemonState::Stopped);
        let rejected = handle.dispatch(|_| ());
        assert!(matches!(
            rejected.await,
            Err(ExecError::Closed | ExecError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn registry_rejects_duplicates_and_closes_everything() {
        let registry = DaemonRegistry::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let first = spawn(
            Counting {
                ticks: Arc::clone(&ticks),
                budget: usize::MAX,
                notes: Vec::new(),
            },
            Duration::from_millis(5),
        );

        assert!(registry.manage("conductor", Box::new(first.clone())));
        assert!(!registry.manage("conductor", Box::new(first.clone())));
        assert_eq!(registry.len(), 1);

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(first.state(), DaemonState::Stopped);
    }
}
