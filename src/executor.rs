use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::EcsConfig;

/// Runs quantized query slices. Implementations must finish every job before returning.
pub trait Executor: Send + Sync {
    fn worker_count(&self) -> usize;

    /// Calls `job(i)` exactly once for every `i` in `0..jobs`, from any number of threads.
    fn for_each(&self, jobs: usize, job: &(dyn Fn(usize) + Sync));
}

/// Default executor, fanning jobs out over scoped threads that pull from a shared counter.
pub struct ScopedExecutor {
    workers: usize,
}

impl ScopedExecutor {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn from_config(config: &EcsConfig) -> Self {
        Self::new(config.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }))
    }
}

impl Default for ScopedExecutor {
    fn default() -> Self {
        Self::from_config(&EcsConfig::default())
    }
}

impl Executor for ScopedExecutor {
    fn worker_count(&self) -> usize {
        self.workers
    }

    fn for_each(&self, jobs: usize, job: &(dyn Fn(usize) + Sync)) {
        if jobs <= 1 || self.workers <= 1 {
            (0..jobs).for_each(job);
            return;
        }

        let next = AtomicUsize::new(0);
        let run = || loop {
            let index = next.fetch_add(1, Ordering::Relaxed);
            if index >= jobs {
                break;
            }
            job(index);
        };

        std::thread::scope(|scope| {
            for _ in 1..self.workers.min(jobs) {
                scope.spawn(run);
            }
            // The calling thread takes part as well
            run();
        });
    }
}
