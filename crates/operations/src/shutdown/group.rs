//! A worker group: long-running tasks under a shared cancellation scope with
//! first-error semantics.
//!
//! Workers are spawned through a [`WorkerSpawner`], which can be cloned and
//! handed to components that need to add workers after boot. The first worker
//! to return an error cancels the scope; [`WorkerGroup::wait`] drains the
//! remaining workers and returns that first error.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

/// Error type carried by workers.
pub type WorkerError = Box<dyn std::error::Error + Send + Sync>;

type Completion = (String, Result<(), WorkerError>);

/// A clonable view of the group's cancellation state.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the scope is cancelled. Resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // An Err means every sender is gone, which only happens when the
        // group itself is dropped; treat that as cancellation too.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Spawns workers into the group. Clonable; lives as long as any holder.
#[derive(Clone)]
pub struct WorkerSpawner {
    done_tx: mpsc::UnboundedSender<Completion>,
    spawned: Arc<AtomicUsize>,
    cancel: Arc<watch::Sender<bool>>,
}

impl WorkerSpawner {
    /// Spawn a named worker. The future should return when its component
    /// stops or the shutdown signal fires.
    pub fn spawn<F>(&self, name: &str, fut: F)
    where
        F: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let guard = CompletionGuard {
            done_tx: self.done_tx.clone(),
            name: name.to_string(),
            sent: false,
        };
        tokio::spawn(async move {
            let mut guard = guard;
            let result = fut.await;
            guard.complete(result);
        });
    }

    /// Cancel the scope. Every worker observing the signal should wind down.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Subscribe to the cancellation state.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.cancel.subscribe(),
        }
    }
}

/// Reports worker completion even when the worker panics: the task unwinds,
/// the guard drops, and the group sees an error instead of hanging.
struct CompletionGuard {
    done_tx: mpsc::UnboundedSender<Completion>,
    name: String,
    sent: bool,
}

impl CompletionGuard {
    fn complete(&mut self, result: Result<(), WorkerError>) {
        self.sent = true;
        let _ = self.done_tx.send((std::mem::take(&mut self.name), result));
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.sent {
            let name = std::mem::take(&mut self.name);
            let err: WorkerError = format!("worker '{name}' panicked").into();
            let _ = self.done_tx.send((name, Err(err)));
        }
    }
}

/// The worker group itself. Owns the completion channel; consumed by `wait`.
pub struct WorkerGroup {
    spawner: WorkerSpawner,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    completed: usize,
}

impl WorkerGroup {
    pub fn new() -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);
        Self {
            spawner: WorkerSpawner {
                done_tx,
                spawned: Arc::new(AtomicUsize::new(0)),
                cancel: Arc::new(cancel),
            },
            done_rx,
            completed: 0,
        }
    }

    pub fn spawner(&self) -> WorkerSpawner {
        self.spawner.clone()
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.spawner.signal()
    }

    pub fn cancel(&self) {
        self.spawner.cancel()
    }

    /// Block until every worker has returned.
    ///
    /// The first worker error cancels the scope and becomes the return value
    /// once the remaining workers drain. Workers spawned while waiting are
    /// waited on as well.
    pub async fn wait(mut self) -> Result<(), WorkerError> {
        let mut first_err: Option<WorkerError> = None;

        while self.completed < self.spawner.spawned.load(Ordering::SeqCst) {
            match self.done_rx.recv().await {
                Some((name, Ok(()))) => {
                    self.completed += 1;
                    tracing::debug!(worker = %name, "worker finished");
                }
                Some((name, Err(err))) => {
                    self.completed += 1;
                    tracing::error!(worker = %name, error = %err, "worker failed, cancelling scope");
                    self.spawner.cancel();
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                // Every sender gone; nothing left to wait for.
                None => break,
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_ok_when_all_workers_finish() {
        let group = WorkerGroup::new();
        let spawner = group.spawner();

        for i in 0..3 {
            spawner.spawn(&format!("worker-{i}"), async { Ok(()) });
        }

        assert!(group.wait().await.is_ok());
    }

    #[tokio::test]
    async fn first_error_cancels_remaining_workers() {
        let group = WorkerGroup::new();
        let spawner = group.spawner();
        let signal = group.signal();

        spawner.spawn("failing", async { Err("boom".into()) });
        spawner.spawn("long-running", {
            let signal = signal.clone();
            async move {
                signal.cancelled().await;
                Ok(())
            }
        });

        let err = group.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn panicking_worker_surfaces_as_error() {
        let group = WorkerGroup::new();
        group.spawner().spawn("bad", async { panic!("oh no") });

        let err = group.wait().await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn workers_spawned_mid_wait_are_awaited() {
        let group = WorkerGroup::new();
        let spawner = group.spawner();

        let late_spawner = spawner.clone();
        spawner.spawn("parent", async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            late_spawner.spawn("child", async { Err("late failure".into()) });
            Ok(())
        });

        let err = group.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "late failure");
    }

    #[tokio::test]
    async fn manual_cancel_unblocks_signal_waiters() {
        let group = WorkerGroup::new();
        let signal = group.signal();

        group.spawner().spawn("waiter", {
            let signal = signal.clone();
            async move {
                signal.cancelled().await;
                Ok(())
            }
        });

        group.cancel();
        assert!(group.wait().await.is_ok());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_cancelled() {
        let group = WorkerGroup::new();
        group.cancel();
        let signal = group.signal();

        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("cancelled() should resolve immediately");
    }
}
