#![forbid(unsafe_code)]

// Worker pool - load-balances router creation across engine workers

use crate::engine::{EngineError, EngineResult, MediaEngine, MediaWorker};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fixed pool of pre-spawned media-engine workers. The pool itself is
/// read-only after startup; load is polled from the engine at selection time.
pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
}

impl WorkerPool {
    /// Spawns `num_workers` workers up front.
    ///
    /// # Errors
    /// Returns an error if any worker fails to spawn; a partially started
    /// pool is not useful.
    pub async fn start(engine: &dyn MediaEngine, num_workers: usize) -> EngineResult<Self> {
        info!("Starting worker pool with {} workers", num_workers);

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let worker = engine.spawn_worker().await?;
            info!("Spawned worker {} with id: {}", i, worker.id());
            workers.push(worker);
        }

        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Selects the worker with the lowest engine-reported CPU usage.
    /// A worker whose usage poll fails is treated as fully loaded rather
    /// than failing the call.
    ///
    /// # Errors
    /// Returns `EngineError::NoWorkers` if the pool is empty. Fatal to the
    /// room-creation path that called it; never retried silently.
    pub async fn least_loaded(&self) -> EngineResult<Arc<dyn MediaWorker>> {
        if self.workers.is_empty() {
            return Err(EngineError::NoWorkers);
        }

        let mut best_idx = 0;
        let mut best_usage = f64::INFINITY;
        for (idx, worker) in self.workers.iter().enumerate() {
            let usage = match worker.usage().await {
                Ok(u) => u,
                Err(e) => {
                    warn!("Failed to poll usage for worker {}: {}", worker.id(), e);
                    f64::INFINITY
                }
            };
            if usage < best_usage {
                best_usage = usage;
                best_idx = idx;
            }
        }

        let worker = self.workers[best_idx].clone();
        debug!(
            "Selected worker {} (index {}, usage {:.2})",
            worker.id(),
            best_idx,
            best_usage
        );
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;

    #[tokio::test]
    async fn picks_the_least_loaded_worker() {
        let engine = MemoryEngine::new();
        let pool = WorkerPool::start(&engine, 3).await.unwrap();

        let ids = engine.worker_ids();
        engine.set_worker_usage(ids[0], 0.9);
        engine.set_worker_usage(ids[1], 0.1);
        engine.set_worker_usage(ids[2], 0.5);

        let worker = pool.least_loaded().await.unwrap();
        assert_eq!(worker.id(), ids[1]);
    }

    #[tokio::test]
    async fn empty_pool_fails_closed() {
        let engine = MemoryEngine::new();
        let pool = WorkerPool::start(&engine, 0).await.unwrap();

        let result = pool.least_loaded().await;
        assert!(matches!(result, Err(EngineError::NoWorkers)));
    }
}
