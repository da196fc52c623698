//! Work-stealing pool for async work execute phases.
//!
//! This module provides the runtime's own worker pool: multiple worker threads
//! with work-stealing, fed through a global injector queue.

use crossbeam_deque::{Injector, Worker as CbWorker};
use parking::Unparker;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use super::worker::{Job, Worker};

/// Handle to a worker thread
struct WorkerHandle {
    /// The worker thread handle
    thread: Option<JoinHandle<()>>,
    /// Unparker to wake up the worker
    unparker: Unparker,
}

/// A multi-threaded work-stealing job pool.
///
/// The pool maintains:
/// - A global injector queue where new jobs are submitted
/// - Per-worker local queues with work-stealing between workers
pub struct WorkStealingPool {
    /// Global queue for newly submitted jobs
    injector: Arc<Injector<Job>>,
    /// Worker thread handles
    workers: Vec<WorkerHandle>,
    /// Number of worker threads
    num_workers: usize,
    /// Shutdown flag
    shutdown: Arc<AtomicBool>,
}

impl WorkStealingPool {
    /// Create a new pool with the specified number of workers.
    ///
    /// If `num_workers` is 0, the number of workers will be automatically
    /// determined based on the number of available CPU cores.
    pub fn new(num_workers: usize) -> io::Result<Self> {
        let num_workers = if num_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            num_workers
        };

        let injector = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        // Create worker local queues and collect stealers
        let locals: Vec<CbWorker<Job>> = (0..num_workers).map(|_| CbWorker::new_fifo()).collect();
        let stealers: Vec<_> = locals.iter().map(|w| w.stealer()).collect();

        let mut workers = Vec::with_capacity(num_workers);
        for (index, local) in locals.into_iter().enumerate() {
            let (parker, unparker) = parking::pair();
            let worker = Worker {
                index,
                local,
                // Give each worker stealers for all OTHER workers
                stealers: stealers
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, s)| s.clone())
                    .collect(),
                injector: injector.clone(),
                shutdown: shutdown.clone(),
                parker,
            };

            let handle = thread::Builder::new()
                .name(format!("napi-worker-{}", index))
                .spawn(move || worker.run())?;

            workers.push(WorkerHandle {
                thread: Some(handle),
                unparker,
            });
        }

        tracing::debug!(num_workers, "worker pool started");
        Ok(Self {
            injector,
            workers,
            num_workers,
            shutdown,
        })
    }

    /// Submit a job to the pool.
    ///
    /// The job is pushed to the global injector queue and a random worker is
    /// woken to process it.
    pub fn submit(&self, job: Job) {
        self.injector.push(job);
        self.wake_one_worker();
    }

    fn wake_one_worker(&self) {
        if !self.workers.is_empty() {
            let idx = fastrand::usize(..self.workers.len());
            self.workers[idx].unparker.unpark();
        }
    }

    /// Get the number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Stop all workers after they drain the queues, and join them.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in &self.workers {
            worker.unparker.unpark();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

impl Drop for WorkStealingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_zero_workers_means_available_parallelism() {
        let pool = WorkStealingPool::new(0).unwrap();
        assert!(pool.num_workers() >= 1);
    }

    #[test]
    fn test_jobs_run_off_the_submitting_thread() {
        let pool = WorkStealingPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        pool.submit(Box::new(move || {
            tx.send(thread::current().id()).unwrap();
        }));
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn test_shutdown_drains_submitted_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkStealingPool::new(2).unwrap();
        for _ in 0..64 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkStealingPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(|| panic!("boom")));
        pool.submit(Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
