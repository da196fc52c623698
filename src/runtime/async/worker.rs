//! Worker thread implementation for the async work pool.
//!
//! Each worker maintains a local queue and can steal from other workers' queues
//! when its own queue is empty, providing good cache locality while ensuring load balancing.

use crossbeam_deque::{Injector, Steal, Stealer, Worker as CbWorker};
use parking::Parker;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A unit of off-thread work. Async work execute phases are submitted as jobs.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A worker thread that runs jobs from its local queue and steals from others.
pub struct Worker {
    /// Worker index (for logs)
    pub index: usize,
    /// Local job queue
    pub local: CbWorker<Job>,
    /// Stealers for sibling workers' queues
    pub stealers: Vec<Stealer<Job>>,
    /// Global injector queue for newly submitted jobs
    pub injector: Arc<Injector<Job>>,
    /// Shutdown signal
    pub shutdown: Arc<AtomicBool>,
    /// Parker for efficient thread parking when no work available
    pub parker: Parker,
}

impl Worker {
    /// Main worker loop - runs until shutdown signal received
    pub fn run(&self) {
        tracing::debug!(worker = self.index, "worker started");
        while !self.shutdown.load(Ordering::Acquire) {
            match self.find_job() {
                Some(job) => self.execute_job(job),
                None => {
                    // Park with timeout to periodically check for shutdown
                    self.parker.park_timeout(Duration::from_millis(1));
                }
            }
        }

        // Drain remaining jobs on shutdown
        self.drain_jobs();
        tracing::debug!(worker = self.index, "worker stopped");
    }

    /// Find a job using the work-stealing algorithm
    fn find_job(&self) -> Option<Job> {
        // 1. Try local queue first
        if let Some(job) = self.local.pop() {
            return Some(job);
        }

        // 2. Try stealing from the global injector
        if let Some(job) = self.steal_from_injector() {
            return Some(job);
        }

        // 3. Try stealing from sibling workers
        self.steal_from_siblings()
    }

    /// Steal a batch of jobs from the global injector queue
    fn steal_from_injector(&self) -> Option<Job> {
        loop {
            match self.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Steal a job from a random sibling worker
    fn steal_from_siblings(&self) -> Option<Job> {
        if self.stealers.is_empty() {
            return None;
        }

        // Start from a random index to avoid contention and ensure fairness
        let start = fastrand::usize(..self.stealers.len());

        for i in 0..self.stealers.len() {
            let idx = (start + i) % self.stealers.len();
            loop {
                match self.stealers[idx].steal() {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    /// Run a job; a panicking job must not take the worker down with it.
    fn execute_job(&self, job: Job) {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(worker = self.index, "job panicked");
        }
    }

    /// Drain any remaining jobs when shutting down
    fn drain_jobs(&self) {
        while let Some(job) = self.local.pop() {
            self.execute_job(job);
        }

        loop {
            match self.injector.steal() {
                Steal::Success(job) => self.execute_job(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
}
