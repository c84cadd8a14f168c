use futures::FutureExt;
use pipeline_core::error::panic_message;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::error;

/// Worker pool errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool {0:?} is stopped")]
    Stopped(String),
    #[error("pool {name:?} is overloaded: {waiting} tasks waiting")]
    Overloaded { name: String, waiting: usize },
}

/// Runs submitted futures with at most `max_pool_size` executing at once.
///
/// Tasks beyond that wait for a permit. When `max_blocking_tasks` is non-zero
/// and that many tasks are already waiting, `submit` fails with
/// [`PoolError::Overloaded`]. Panics inside tasks are caught and logged.
pub struct WorkerPool {
    name: String,
    max_pool_size: usize,
    max_blocking_tasks: usize,
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, max_pool_size: usize, max_blocking_tasks: usize) -> Self {
        let max_pool_size = max_pool_size.max(1);
        Self {
            name: name.into(),
            max_pool_size,
            max_blocking_tasks,
            permits: Arc::new(Semaphore::new(max_pool_size)),
            waiting: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks currently executing.
    pub fn running(&self) -> usize {
        self.max_pool_size - self.permits.available_permits()
    }

    /// Tasks submitted but not yet executing.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.tracker.is_closed()
    }

    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(PoolError::Stopped(self.name.clone()));
        }
        if self.max_blocking_tasks > 0 {
            let waiting = self.waiting.load(Ordering::Relaxed);
            if waiting >= self.max_blocking_tasks {
                return Err(PoolError::Overloaded {
                    name: self.name.clone(),
                    waiting,
                });
            }
        }

        self.waiting.fetch_add(1, Ordering::Relaxed);
        let permits = Arc::clone(&self.permits);
        let waiting = Arc::clone(&self.waiting);
        let name = self.name.clone();
        self.tracker.spawn(async move {
            let permit = permits.acquire_owned().await;
            waiting.fetch_sub(1, Ordering::Relaxed);
            // the semaphore is never closed
            let Ok(_permit) = permit else {
                return;
            };
            if let Err(payload) = AssertUnwindSafe(task).catch_unwind().await {
                error!(pool = %name, panic = %panic_message(&*payload), "recovered panic in pool task");
            }
        });
        Ok(())
    }

    /// Rejects further submissions and waits for every submitted task.
    pub async fn stop_and_wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
