use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("worker pool is shut down")]
    Closed,
    #[error("worker task failed: {0}")]
    Join(String),
}

/// Bounded offload for CPU-heavy handler work. The dispatch loop never uses
/// this itself; handlers opt in so they stop blocking the connection tasks.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<F, T>(&self, task: F) -> Result<T, WorkerPoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| WorkerPoolError::Closed)?;
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        });
        handle
            .await
            .map_err(|error| WorkerPoolError::Join(error.to_string()))
    }
}
