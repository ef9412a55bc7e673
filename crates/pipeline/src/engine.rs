//! Bounded execution of codec work.
//!
//! A worker semaphore caps simultaneous transforms; a second semaphore
//! sized `concurrency + queue_size` bounds how many requests may wait.
//! Overflow fails fast so the server can shed load instead of piling
//! up decode jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::Error;

#[derive(Clone)]
pub struct Engine {
    tickets: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    process_timeout: Duration,
}

impl Engine {
    pub fn new(concurrency: usize, queue_size: usize, process_timeout: Duration) -> Self {
        Self {
            tickets: Arc::new(Semaphore::new(concurrency + queue_size)),
            workers: Arc::new(Semaphore::new(concurrency)),
            process_timeout,
        }
    }

    /// Run `work` on the blocking pool under the concurrency budget.
    ///
    /// The worker slot frees on timeout even though the blocking task
    /// cannot be interrupted mid-codec; the deadline bounds what the
    /// caller waits for, not the codec itself.
    pub async fn run<T, F>(&self, work: F) -> Result<T, Error>
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let Ok(_ticket) = Arc::clone(&self.tickets).try_acquire_owned() else {
            return Err(Error::Overloaded);
        };
        let permit = timeout(self.process_timeout, Arc::clone(&self.workers).acquire_owned())
            .await
            .map_err(|_| Error::Timeout { phase: "process" })?
            .map_err(|_| Error::Overloaded)?;
        let handle = tokio::task::spawn_blocking(work);
        let joined = timeout(self.process_timeout, handle)
            .await
            .map_err(|_| Error::Timeout { phase: "process" })?
            .map_err(|e| Error::Internal(format!("transform worker: {e}")))?;
        drop(permit);
        joined
    }
}
