//! # Service Lifecycle
//!
//! The start/stop primitive shared by every long-running network service: a
//! cancellation signal plus a completion barrier.
//!
//! - Every task of a service is spawned through [`Lifecycle::spawn`], which
//!   registers it with the barrier (a `TaskTracker`) before it starts. The
//!   barrier is released when the task's future completes, whatever the exit
//!   path.
//! - [`Lifecycle::stop`] fires the cancellation token once and then waits
//!   until the barrier drains. Calling it again is harmless: later calls only
//!   wait.
//!
//! Tasks observe cancellation at every loop head and race it against every
//! blocking call, so worst-case shutdown latency is one poll interval.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Observable state of a [`Lifecycle`]. There is no way back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Accepting work.
    Running,
    /// Cancellation fired, waiting for tasks to exit.
    Stopping,
    /// Every registered task has exited.
    Stopped,
}

/// Cancellation signal and completion barrier for one service.
///
/// Cheap to clone; clones share the same signal and barrier.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    token: CancellationToken,
    tracker: TaskTracker,
    state: AtomicU8,
}

impl Lifecycle {
    /// Creates a running lifecycle for the service called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                state: AtomicU8::new(RUNNING),
            }),
        }
    }

    /// Service name, used as the logging prefix.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// A handle on the service's cancellation signal.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// `true` once [`stop`](Self::stop) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Spawns `task` on the runtime, registered against the barrier.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    /// Number of registered tasks that have not exited yet.
    pub fn active_tasks(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        match self.inner.state.load(Ordering::Acquire) {
            RUNNING => LifecycleState::Running,
            STOPPING => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    /// Fires the cancellation signal and blocks until every registered task
    /// has exited.
    pub async fn stop(&self) {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(
                "{}: stopping, waiting on {} task(s)",
                self.name(),
                self.active_tasks()
            );
            self.inner.token.cancel();
            self.inner.tracker.close();
        } else {
            debug!("{}: stop already in progress", self.name());
        }

        self.inner.tracker.wait().await;
        self.inner.state.store(STOPPED, Ordering::Release);
        info!("{}: stopped", self.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_waits_for_every_task() {
        let lifecycle = Lifecycle::new("test");
        let exited = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let token = lifecycle.token();
            let exited = Arc::clone(&exited);
            lifecycle.spawn(async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                exited.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(lifecycle.state(), LifecycleState::Running);
        assert_eq!(lifecycle.active_tasks(), 4);

        lifecycle.stop().await;

        assert_eq!(exited.load(Ordering::SeqCst), 4);
        assert_eq!(lifecycle.active_tasks(), 0);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let lifecycle = Lifecycle::new("twice");
        let token = lifecycle.token();
        lifecycle.spawn(async move { token.cancelled().await });

        lifecycle.stop().await;
        lifecycle.stop().await;

        assert!(lifecycle.is_cancelled());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_stops_both_return() {
        let lifecycle = Lifecycle::new("racing");
        let token = lifecycle.token();
        lifecycle.spawn(async move { token.cancelled().await });

        let other = lifecycle.clone();
        tokio::join!(lifecycle.stop(), other.stop());

        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn stop_with_no_tasks_returns_immediately() {
        let lifecycle = Lifecycle::new("idle");
        tokio::time::timeout(Duration::from_secs(1), lifecycle.stop())
            .await
            .expect("stop should not block");
    }
}
