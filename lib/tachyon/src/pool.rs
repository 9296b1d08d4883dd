//! A bounded pool of worker threads draining a FIFO queue of thread jobs.
//! Jobs are `Thread` objects that have not been started; a worker executes
//! the job's closure on itself, so `join`/`result` on the job behave the
//! same as for independently started threads.

use crate::thread::Thread;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

enum Job {
    Run(Arc<Thread>),
    Stop,
}

struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
}

impl JobQueue {
    fn new() -> JobQueue {
        JobQueue {
            jobs: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn put(&self, job: Job) {
        self.jobs.lock().unwrap().push_back(job);
        self.available.notify_one();
    }

    fn take(&self) -> Job {
        let mut jobs = self.jobs.lock().unwrap();
        loop {
            if let Some(job) = jobs.pop_front() {
                return job;
            }
            jobs = self.available.wait(jobs).unwrap();
        }
    }

    /// Distinguishes "timed out" (`None`) from "got a job".
    fn take_timeout(&self, timeout: Duration) -> Option<Job> {
        let deadline = std::time::Instant::now() + timeout;
        let mut jobs = self.jobs.lock().unwrap();
        loop {
            if let Some(job) = jobs.pop_front() {
                return Some(job);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.available.wait_timeout(jobs, deadline - now).unwrap();
            jobs = guard;
        }
    }
}

pub struct ThreadPool {
    queue: Arc<JobQueue>,
    workers: Vec<Arc<Thread>>,
}

impl ThreadPool {
    pub fn new() -> ThreadPool {
        ThreadPool::with_limits(0, 0)
    }

    /// Pool sized from the library configuration.
    pub fn from_config(config: &quark::Config) -> ThreadPool {
        ThreadPool::with_limits(config.min_threads, config.reserved_cores)
    }

    /// Worker count is `max(1, max(min_threads, parallelism − reserved))`.
    pub fn with_limits(min_threads: usize, reserved_cores: usize) -> ThreadPool {
        let ideal = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let count = 1.max(min_threads.max(ideal.saturating_sub(reserved_cores)));
        let queue = Arc::new(JobQueue::new());
        let workers = (0..count)
            .map(|index| {
                let queue = queue.clone();
                let worker = Thread::new(&format!("pooled-{}", index), move || {
                    while yield_on(&queue, None) {}
                    0
                });
                worker
                    .start()
                    .expect("Pool workers are started exactly once");
                worker
            })
            .collect();
        ThreadPool { queue, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a job for execution on some worker and returns it.
    pub fn run(&self, job: Arc<Thread>) -> Arc<Thread> {
        self.queue.put(Job::Run(job.clone()));
        job
    }

    /// Executes one queued job on the calling thread, letting pooled code
    /// drain nested work without deadlocking the pool. Returns false when
    /// the pool is stopping or, with a timeout, when no job arrived.
    pub fn yield_one(&self, timeout: Option<Duration>) -> bool {
        yield_on(&self.queue, timeout)
    }
}

fn yield_on(queue: &JobQueue, timeout: Option<Duration>) -> bool {
    let job = match timeout {
        None => Some(queue.take()),
        Some(timeout) => queue.take_timeout(timeout),
    };
    match job {
        Some(Job::Run(thread)) => {
            thread.execute_inline();
            true
        }
        Some(Job::Stop) | None => false,
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            self.queue.put(Job::Stop);
        }
        for worker in &self.workers {
            worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_pool_runs_queued_jobs() {
        let pool = ThreadPool::with_limits(2, 0);
        let counter = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..8)
            .map(|i| {
                let counter = counter.clone();
                pool.run(Thread::new(&format!("job-{}", i), move || {
                    counter.fetch_add(1, Ordering::SeqCst) as isize
                }))
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 8 && Instant::now() < deadline {
            Thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);

        for job in &jobs {
            job.join();
            assert!(job.is_finished());
        }
    }

    #[test]
    fn test_yield_executes_inline() {
        let pool = ThreadPool::with_limits(1, 0);
        // Saturate the single worker so the next queued job stays queued.
        let gate = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let gate_inner = gate.clone();
        let started_inner = started.clone();
        pool.run(Thread::new("blocker", move || {
            started_inner.store(1, Ordering::SeqCst);
            while gate_inner.load(Ordering::SeqCst) == 0 {
                Thread::sleep(Duration::from_millis(1));
            }
            0
        }));
        while started.load(Ordering::SeqCst) == 0 {
            Thread::sleep(Duration::from_millis(1));
        }

        let hit = Arc::new(AtomicUsize::new(0));
        let hit_inner = hit.clone();
        pool.run(Thread::new("inline", move || {
            hit_inner.store(1, Ordering::SeqCst);
            0
        }));

        assert!(pool.yield_one(Some(Duration::from_secs(2))));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        gate.store(1, Ordering::SeqCst);
    }

    #[test]
    fn test_yield_timeout_returns_false() {
        let pool = ThreadPool::with_limits(1, 0);
        let start = Instant::now();
        assert!(!pool.yield_one(Some(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_worker_count_lower_bound() {
        let pool = ThreadPool::with_limits(0, usize::MAX);
        assert_eq!(pool.worker_count(), 1);
    }
}
