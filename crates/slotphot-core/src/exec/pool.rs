use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::info;

use crate::error::{PhotError, Result};
use crate::exec::task::{TaskExecutor, TaskReport};

/// Fixed-size pool of worker threads. Batches block until every job is done
/// and results come back in submission order.
pub struct WorkerPool {
    pool: ThreadPool,
    n_workers: usize,
}

impl WorkerPool {
    /// Create a pool of `n_workers` threads; 0 means one per available core.
    pub fn new(n_workers: usize) -> Result<Self> {
        let n_workers = if n_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            n_workers
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|i| format!("slotphot-worker-{i}"))
            .build()
            .map_err(|e| PhotError::Config(format!("cannot start worker pool: {e}")))?;
        info!(n_workers, "Worker pool started");
        Ok(Self { pool, n_workers })
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Apply `job` to every item, in parallel, preserving order.
    pub fn map<I, T, F>(&self, items: &[I], job: F) -> Vec<T>
    where
        I: Sync,
        T: Send,
        F: Fn(&I) -> T + Sync,
    {
        self.pool.install(|| items.par_iter().map(&job).collect())
    }

    /// Run `job(i)` for every index through `executor`. Failed jobs yield
    /// `None`; exceeding the executor's failure cap aborts the batch.
    pub fn run_tasks<T, F>(
        &self,
        executor: &TaskExecutor,
        indices: &[usize],
        job: F,
    ) -> Result<Vec<Option<T>>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync,
    {
        self.pool.install(|| {
            indices
                .par_iter()
                .map(|&i| executor.execute(i, || job(i)))
                .collect()
        })
    }

    /// Stop the pool, logging the final counts of `executors`.
    pub fn shutdown(self, executors: &[&TaskExecutor]) -> Vec<TaskReport> {
        let reports: Vec<TaskReport> = executors.iter().map(|e| e.report()).collect();
        for r in &reports {
            info!(
                task = %r.name,
                successes = r.successes,
                failures = r.failures,
                "Final task counts"
            );
        }
        info!(n_workers = self.n_workers, "Worker pool shut down");
        drop(self.pool);
        reports
    }
}

/// Indices `i` whose result is `Some`.
pub fn successful<T>(results: &[Option<T>]) -> Vec<usize> {
    results
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.as_ref().map(|_| i))
        .collect()
}
