//! Lifecycle primitives for the subsystems a node runs on its event
//! loop: a cross-thread stop order ([`StopHandle`]/[`StopSignal`]) and a
//! [`TaskSet`] owning the loop's long-lived tasks from spawn to join.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, trace};

struct Shared {
    stopped: AtomicBool,
    notify: Notify,
}

/// Controlling-thread side of the stop order. Posting to it is the only
/// cross-thread operation the loop accepts; dropping the handle stops
/// nothing.
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub fn new() -> (StopHandle, StopSignal) {
        let shared = Arc::new(Shared {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        });

        (
            StopHandle {
                shared: Arc::clone(&shared),
            },
            StopSignal { shared },
        )
    }

    /// Orders every [`StopSignal`] clone to wind down. Idempotent; safe
    /// from any thread.
    pub fn signal(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

/// Loop-thread side of the stop order, cloned into every task that must
/// observe it.
#[derive(Clone)]
pub struct StopSignal {
    shared: Arc<Shared>,
}

impl StopSignal {
    /// Resolves once the stop order is given, immediately if it already
    /// was. Cancel-safe, so it can sit in a `select!` arm.
    pub async fn stopped(&self) {
        // Register before checking the flag; an order landing in between
        // wakes the registered future, so it cannot be missed.
        let notified = self.shared.notify.notified();
        if self.shared.stopped.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

/// The long-lived tasks of one node loop. Joining reports each task's
/// fate under its name; tasks still running when the set is dropped are
/// aborted, so a failed loop setup cannot leak them.
pub struct TaskSet {
    tasks: Vec<(&'static str, JoinHandle<anyhow::Result<()>>)>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks.push((name, tokio::task::spawn(future)));
    }

    /// Awaits every task and logs how it went. Call after the stop order
    /// has been given, or this waits for the tasks' natural end.
    pub async fn join_all(mut self) {
        for (name, handle) in std::mem::take(&mut self.tasks) {
            match handle.await {
                Ok(Ok(())) => trace!(task = name, "task terminated gracefully"),
                Ok(Err(error)) => error!(task = name, error = format!("{error:#}"), "task failed"),
                Err(error) => error!(task = name, %error, "task panicked or was aborted"),
            }
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for (_, handle) in &self.tasks {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[tokio::test]
    async fn stop_order_reaches_every_clone() {
        let (handle, first) = StopHandle::new();
        let second = first.clone();

        handle.signal();

        first.stopped().await;
        second.stopped().await;
        assert!(second.is_stopped());
    }

    #[tokio::test]
    async fn stop_order_given_before_waiting_is_observed() {
        let (handle, signal) = StopHandle::new();

        handle.signal();

        // No waiter was registered when the order was given.
        signal.stopped().await;
    }

    #[tokio::test]
    async fn waiter_registered_first_is_woken() {
        let (handle, signal) = StopHandle::new();

        let waiter = tokio::spawn(async move { signal.stopped().await });
        tokio::task::yield_now().await;

        handle.signal();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn join_all_reports_and_drains() {
        let (handle, signal) = StopHandle::new();
        let mut tasks = TaskSet::new();

        let worker_signal = signal.clone();
        tasks.spawn("worker", async move {
            worker_signal.stopped().await;
            Ok(())
        });
        tasks.spawn("failing worker", async { Err(anyhow::anyhow!("boom")) });

        handle.signal();
        tasks.join_all().await;
    }

    #[tokio::test]
    async fn dropping_the_set_aborts_its_tasks() {
        let witness = Arc::new(AtomicBool::new(false));
        let task_witness = Arc::clone(&witness);

        let mut tasks = TaskSet::new();
        tasks.spawn("sleeper", async move {
            tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
            task_witness.store(true, Ordering::SeqCst);
            Ok(())
        });

        drop(tasks);
        tokio::task::yield_now().await;

        assert!(!witness.load(Ordering::SeqCst));
    }
}
