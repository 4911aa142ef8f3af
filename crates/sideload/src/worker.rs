//! Named worker pools bounding the concurrency of one restore stage.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A fixed-size permit set with a name.
///
/// Three independent pools gate the pipeline: *table* caps catalog metadata
/// pressure, *region* caps parser/encoder memory, *io* caps open file
/// descriptors in the block reader.
pub struct Pool {
    name: &'static str,
    sem: Arc<Semaphore>,
}

/// A held permit. Dropping the worker returns the permit to its pool.
pub struct Worker {
    pool: &'static str,
    _permit: OwnedSemaphorePermit,
}

impl Pool {
    pub fn new(capacity: usize, name: &'static str) -> Self {
        Self {
            name,
            sem: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Wait for a permit. FIFO on the wait queue, no other fairness guarantee.
    pub async fn apply(&self) -> Worker {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore closed");
        tracing::trace!(pool = self.name, "worker acquired");
        Worker {
            pool: self.name,
            _permit: permit,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        tracing::trace!(pool = self.pool, "worker recycled");
    }
}
