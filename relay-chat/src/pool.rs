use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinHandle};

/// Slots in the default pool: enough for a client's two engine loops plus a
/// healthy number of in-flight commands.
pub const DEFAULT_WORKERS: usize = 32;

/// Process-wide bounded spawner.
///
/// Each task holds one slot for its whole lifetime; tasks spawned while the
/// pool is full queue until a slot frees up. Clones share the same slots.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            // The semaphore is never closed, so this only waits.
            let _slot = slots.acquire_owned().await;
            task.await
        })
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}
