// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker pool for async runs.
//!
//! Each scope starts its own fixed set of OS threads pulling jobs from a
//! shared crossbeam injector. Idle workers sleep on a condvar. A run that
//! parks does not occupy a worker: its wake hook submits it again.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};

use crate::continuation::CoroutineError;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

struct Shared {
    name: String,
    queue: Injector<Job>,
    lock: Mutex<()>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// Cloneable submission handle. Safe to use from wake hooks: it only
/// touches the pool's own queue and lock.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    shared: Arc<Shared>,
}

impl PoolHandle {
    pub fn submit(&self, job: Job) {
        self.shared.queue.push(job);
        let _lock = self.shared.lock.lock();
        self.shared.available.notify_one();
    }
}

pub(crate) struct WorkerPool {
    handle: PoolHandle,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `threads` workers. On failure the workers already started are
    /// stopped again.
    pub fn start(name: &str, threads: usize) -> Result<Self, CoroutineError> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            queue: Injector::new(),
            lock: Mutex::new(()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let pool = Self {
            handle: PoolHandle {
                shared: shared.clone(),
            },
            workers: Mutex::new(Vec::with_capacity(threads)),
        };

        for id in 0..threads.max(1) {
            let shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", name, id))
                .spawn(move || worker_loop(id, shared));
            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(CoroutineError::WorkerSpawn(e.to_string()));
                }
            }
        }

        tracing::debug!(pool = name, threads, "worker pool started");
        Ok(pool)
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop the workers once the queue is empty and join them.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        shared.shutdown.store(true, Ordering::Release);
        {
            let _lock = shared.lock.lock();
            shared.available.notify_all();
        }

        let me = thread::current().id();
        for worker in std::mem::take(&mut *self.workers.lock()) {
            if worker.thread().id() == me {
                continue;
            }
            let _ = worker.join();
        }
        tracing::debug!(pool = %shared.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Never join here: the last owner may be one of the workers.
        let shared = &self.handle.shared;
        shared.shutdown.store(true, Ordering::Release);
        let _lock = shared.lock.lock();
        shared.available.notify_all();
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>) {
    loop {
        match shared.queue.steal() {
            Steal::Success(job) => run_job(id, &shared, job),
            Steal::Retry => continue,
            Steal::Empty => {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let mut lock = shared.lock.lock();
                if shared.queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                    shared.available.wait(&mut lock);
                }
            }
        }
    }
}

fn run_job(id: usize, shared: &Shared, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!(pool = %shared.name, worker = id, "job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_for(counter: &AtomicUsize, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < n {
            assert!(Instant::now() < deadline, "jobs did not run");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::start("test", 2).unwrap();
        assert_eq!(pool.threads(), 2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let done = done.clone();
            pool.handle().submit(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        wait_for(&done, 100);
        pool.shutdown();
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn worker_survives_panicking_job() {
        let pool = WorkerPool::start("test", 1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        pool.handle().submit(Box::new(|| panic!("boom")));
        let d = done.clone();
        pool.handle().submit(Box::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        }));
        wait_for(&done, 1);
        pool.shutdown();
    }

    #[test]
    fn zero_threads_still_starts_one() {
        let pool = WorkerPool::start("test", 0).unwrap();
        assert_eq!(pool.threads(), 1);
        pool.shutdown();
    }
}
