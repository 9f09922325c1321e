//! Bounded fixed-size worker pool dispatching per-sensor compute jobs in
//! parallel. Mirrors the teacher's per-actuator thread + bounded channel
//! idiom (`component_b/multi_actuator.rs`) generalized to `N` identical
//! workers pulling from one shared queue instead of one thread per role.
//!
//! Jobs are plain data + a pure compute function (DESIGN.md, "Dynamic
//! dispatch of compute jobs") — never trait objects.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool task queue is saturated")]
    PoolSaturated,
}

/// Single-sensor input bypasses the pool entirely (spec.md §4.6 threshold).
const BYPASS_THRESHOLD: usize = 1;

type Job<T> = Box<dyn FnOnce() -> T + Send>;

enum Task<T> {
    Run(Job<T>, Sender<(usize, Result<T, String>)>, usize),
    Shutdown,
}

/// Observability counters: dispatched, completed, failed, queue-high-watermark.
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub queue_high_watermark: AtomicUsize,
}

/// Fixed-size pool of `min(num_cpu, 4)` threads with a bounded task queue.
/// A failing job returns `Err` for that sensor but never poisons the pool
/// (fail-open, spec.md §4.6).
pub struct WorkerPool<T: Send + 'static> {
    tx: Sender<Task<T>>,
    handles: Vec<JoinHandle<()>>,
    counters: Arc<PoolCounters>,
    queue_capacity: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(num_threads: usize, queue_capacity: usize) -> Self {
        let num_threads = num_threads.max(1);
        let (tx, rx) = bounded::<Task<T>>(queue_capacity);
        let counters = Arc::new(PoolCounters::default());
        let mut handles = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let rx: Receiver<Task<T>> = rx.clone();
            let counters = counters.clone();
            handles.push(thread::spawn(move || worker_loop(rx, counters)));
        }
        Self { tx, handles, counters, queue_capacity }
    }

    /// Dispatches per-sensor compute jobs and returns as they complete.
    /// Bypasses the pool for a single job. Returns `Err(PoolSaturated)` if
    /// the bounded queue rejects a dispatch — the caller is expected to
    /// fall back to sequential execution for that tick.
    pub fn map_unordered<I>(&self, jobs: Vec<I>, f: impl Fn(I) -> T + Send + Sync + 'static) -> Result<Vec<Result<T, String>>, PoolError>
    where
        I: Send + 'static,
    {
        if jobs.len() <= BYPASS_THRESHOLD {
            return Ok(jobs.into_iter().map(|j| Ok(f(j))).collect());
        }

        let f = Arc::new(f);
        let (result_tx, result_rx) = bounded(jobs.len());
        let total = jobs.len();

        for (idx, job) in jobs.into_iter().enumerate() {
            let f = f.clone();
            let job_fn: Job<T> = Box::new(move || f(job));
            match self.tx.try_send(Task::Run(job_fn, result_tx.clone(), idx)) {
                Ok(()) => {
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    let q = self.tx.len();
                    self.counters.queue_high_watermark.fetch_max(q, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => return Err(PoolError::PoolSaturated),
                Err(TrySendError::Disconnected(_)) => return Err(PoolError::PoolSaturated),
            }
        }

        let mut results: Vec<Option<Result<T, String>>> = (0..total).map(|_| None).collect();
        for _ in 0..total {
            match result_rx.recv() {
                Ok((idx, res)) => results[idx] = Some(res),
                Err(_) => break,
            }
        }
        Ok(results.into_iter().map(|r| r.unwrap_or_else(|| Err("worker dropped result".into()))).collect())
    }

    pub fn counters(&self) -> &PoolCounters {
        &self.counters
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Drains in-flight work then joins threads.
    pub fn shutdown(mut self) {
        for _ in &self.handles {
            let _ = self.tx.send(Task::Shutdown);
        }
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn worker_loop<T: Send + 'static>(rx: Receiver<Task<T>>, counters: Arc<PoolCounters>) {
    loop {
        match rx.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(Task::Run(job, result_tx, idx)) => {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                match outcome {
                    Ok(value) => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                        let _ = result_tx.send((idx, Ok(value)));
                    }
                    Err(_) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        let _ = result_tx.send((idx, Err("worker job panicked".into())));
                    }
                }
            }
            Ok(Task::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_job_bypasses_pool() {
        let pool: WorkerPool<i32> = WorkerPool::new(2, 8);
        let results = pool.map_unordered(vec![5], |x: i32| x * 2).unwrap();
        assert_eq!(results, vec![Ok(10)]);
        assert_eq!(pool.counters().dispatched.load(Ordering::Relaxed), 0);
        pool.shutdown();
    }

    #[test]
    fn multiple_jobs_all_complete() {
        let pool: WorkerPool<i32> = WorkerPool::new(2, 8);
        let results = pool.map_unordered(vec![1, 2, 3, 4], |x: i32| x * 10).unwrap();
        let mut values: Vec<i32> = results.into_iter().map(|r| r.unwrap()).collect();
        values.sort();
        assert_eq!(values, vec![10, 20, 30, 40]);
        pool.shutdown();
    }

    #[test]
    fn failing_job_does_not_poison_pool() {
        let pool: WorkerPool<i32> = WorkerPool::new(2, 8);
        let results = pool.map_unordered(vec![1, 2], |x: i32| {
            if x == 1 {
                panic!("boom");
            }
            x
        });
        let results = results.unwrap();
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
        // pool still usable after a failing job
        let again = pool.map_unordered(vec![9, 10], |x: i32| x).unwrap();
        assert!(again.iter().all(|r| r.is_ok()));
        pool.shutdown();
    }

    #[test]
    fn queue_saturation_returns_pool_saturated() {
        let pool: WorkerPool<i32> = WorkerPool::new(1, 1);
        // Flood with enough slow jobs to exceed a queue of capacity 1.
        let jobs: Vec<i32> = (0..50).collect();
        let result = pool.map_unordered(jobs, |x: i32| {
            std::thread::sleep(std::time::Duration::from_millis(50));
            x
        });
        assert!(matches!(result, Err(PoolError::PoolSaturated)));
        pool.shutdown();
    }
}
