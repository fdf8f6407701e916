// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! A bounded pool of named worker threads. At most `max_pool_size` workers
//! exist at any time and at most `queue_capacity` jobs wait for a free worker.
//! When both bounds are exhausted the submitting thread runs the job itself,
//! so work is never dropped and submission never blocks indefinitely.

use crate::error::ExecutorError;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::{
    cmp::max,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, info};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Workers kept alive even when idle.
    pub core_pool_size: usize,
    /// Upper bound on the number of workers. Workers above the core size are
    /// only spawned when the queue is full.
    pub max_pool_size: usize,
    /// How long a worker above the core size may stay idle before retiring.
    pub keep_alive: Duration,
    /// `None` makes the queue unbounded, in which case jobs are never run on
    /// the caller.
    pub queue_capacity: Option<usize>,
    pub thread_name_prefix: String,
}

impl ExecutorConfig {
    /// A pool with exactly one worker and an unbounded queue. Jobs submitted
    /// from a single thread run in submission order.
    pub fn single_worker(thread_name_prefix: &str) -> Self {
        Self {
            core_pool_size: 1,
            max_pool_size: 1,
            keep_alive: Duration::from_secs(1),
            queue_capacity: None,
            thread_name_prefix: thread_name_prefix.to_string(),
        }
    }
}

/// Where a submitted job ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// Enqueued for an existing worker.
    Queued,
    /// Handed to a freshly spawned (non-core) worker.
    Spawned,
    /// Executed on the submitting thread because the pool was saturated.
    CallerRuns,
}

/// Failure of [`BoundedExecutor::try_execute`], handing the job back.
pub enum TryExecuteError {
    /// Queue full and pool at its maximum size.
    Saturated(Job),
    Shutdown(Job),
}

impl std::fmt::Debug for TryExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TryExecuteError::Saturated(_) => write!(f, "Saturated"),
            TryExecuteError::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

struct Shared {
    thread_name_prefix: String,
    receiver: Receiver<Job>,
    core_pool_size: AtomicUsize,
    max_pool_size: AtomicUsize,
    keep_alive_ms: AtomicU64,
    pool_size: AtomicUsize,
    active_count: AtomicUsize,
    completed_count: AtomicU64,
    thread_counter: AtomicUsize,
    shutdown: AtomicBool,
}

impl Shared {
    fn run(&self, job: Job) {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(
                thread = thread::current().name().unwrap_or("unnamed"),
                "Job panicked on a bounded executor worker"
            );
        }
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        self.completed_count.fetch_add(1, Ordering::Relaxed);
    }

    fn keep_alive(&self) -> Duration {
        Duration::from_millis(max(1, self.keep_alive_ms.load(Ordering::Relaxed)))
    }

    /// Gives up a worker slot if the pool is above its core size. The caller
    /// must exit without touching `pool_size` again when this returns true.
    fn try_retire(&self) -> bool {
        self.pool_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                if size > self.core_pool_size.load(Ordering::SeqCst) {
                    Some(size - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

fn worker_loop(shared: Arc<Shared>, first_job: Option<Job>) {
    if let Some(job) = first_job {
        shared.run(job);
    }

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        match shared.receiver.recv_timeout(shared.keep_alive()) {
            Ok(job) => shared.run(job),
            Err(RecvTimeoutError::Timeout) => {
                if shared.try_retire() {
                    debug!(
                        thread = thread::current().name().unwrap_or("unnamed"),
                        "Idle worker retired"
                    );
                    return;
                }
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.pool_size.fetch_sub(1, Ordering::SeqCst);
}

pub struct BoundedExecutor {
    sender: RwLock<Option<Sender<Job>>>,
    queue_capacity: Option<usize>,
    shared: Arc<Shared>,
}

impl BoundedExecutor {
    /// Create the pool and eagerly spawn its core workers.
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        if config.core_pool_size == 0 || config.core_pool_size > config.max_pool_size {
            return Err(ExecutorError::InvalidPoolSize {
                core: config.core_pool_size,
                max: config.max_pool_size,
            });
        }

        let (sender, receiver) = match config.queue_capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let executor = Self {
            sender: RwLock::new(Some(sender)),
            queue_capacity: config.queue_capacity,
            shared: Arc::new(Shared {
                thread_name_prefix: config.thread_name_prefix,
                receiver,
                core_pool_size: AtomicUsize::new(config.core_pool_size),
                max_pool_size: AtomicUsize::new(config.max_pool_size),
                keep_alive_ms: AtomicU64::new(config.keep_alive.as_millis() as u64),
                pool_size: AtomicUsize::new(0),
                active_count: AtomicUsize::new(0),
                completed_count: AtomicU64::new(0),
                thread_counter: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
        };

        for _ in 0..config.core_pool_size {
            if executor.add_worker(config.core_pool_size, None).is_err() {
                executor.shutdown_now();
                return Err(ExecutorError::Spawn(config.core_pool_size));
            }
        }
        info!(
            prefix = executor.shared.thread_name_prefix.as_str(),
            core_pool_size = config.core_pool_size,
            max_pool_size = config.max_pool_size,
            queue_capacity = ?config.queue_capacity,
            "Bounded executor started"
        );
        Ok(executor)
    }

    /// Try to hand `func` to the pool without running it on this thread. If
    /// the queue is full, a new worker is spawned (up to `max_pool_size`) and
    /// takes the job as its first task. Otherwise the job is passed back.
    pub fn try_execute<F>(&self, func: F) -> Result<Submission, TryExecuteError>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(func);
        let sender = self.sender.read();
        let sender = match sender.as_ref() {
            Some(sender) => sender,
            None => return Err(TryExecuteError::Shutdown(job)),
        };

        match sender.try_send(job) {
            Ok(()) => Ok(Submission::Queued),
            Err(TrySendError::Full(job)) => {
                let limit = self.shared.max_pool_size.load(Ordering::SeqCst);
                match self.add_worker(limit, Some(job)) {
                    Ok(()) => Ok(Submission::Spawned),
                    Err(Some(job)) => Err(TryExecuteError::Saturated(job)),
                    Err(None) => unreachable!("job is always handed back when spawning fails"),
                }
            },
            Err(TrySendError::Disconnected(job)) => Err(TryExecuteError::Shutdown(job)),
        }
    }

    /// Like [`BoundedExecutor::try_execute`], but a saturated pool runs the job
    /// on the calling thread before returning.
    pub fn execute<F>(&self, func: F) -> Result<Submission, ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.try_execute(func) {
            Ok(submission) => Ok(submission),
            Err(TryExecuteError::Saturated(job)) => {
                debug!(
                    queued = self.queued_count(),
                    pool_size = self.pool_size(),
                    "Executor saturated, running job on the caller thread"
                );
                job();
                Ok(Submission::CallerRuns)
            },
            Err(TryExecuteError::Shutdown(_)) => Err(ExecutorError::Shutdown),
        }
    }

    /// Stop accepting jobs. Queued jobs still run, then the workers exit.
    pub fn shutdown(&self) {
        self.sender.write().take();
    }

    /// Stop accepting jobs and drop everything still queued. Running jobs are
    /// not interrupted. Returns the number of dropped jobs.
    pub fn shutdown_now(&self) -> usize {
        self.shared.shutdown.store(true, Ordering::Release);
        self.sender.write().take();
        let dropped = self.shared.receiver.try_iter().count();
        if dropped > 0 {
            info!(dropped = dropped, "Dropped queued jobs on shutdown");
        }
        dropped
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.read().is_none()
    }

    pub fn core_pool_size(&self) -> usize {
        self.shared.core_pool_size.load(Ordering::SeqCst)
    }

    pub fn max_pool_size(&self) -> usize {
        self.shared.max_pool_size.load(Ordering::SeqCst)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.shared.keep_alive_ms.load(Ordering::Relaxed))
    }

    /// Number of live workers.
    pub fn pool_size(&self) -> usize {
        self.shared.pool_size.load(Ordering::SeqCst)
    }

    /// Approximate number of workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.shared.active_count.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> u64 {
        self.shared.completed_count.load(Ordering::Relaxed)
    }

    pub fn queued_count(&self) -> usize {
        self.shared.receiver.len()
    }

    pub fn queue_capacity(&self) -> Option<usize> {
        self.queue_capacity
    }

    /// Growing the core size spawns the missing workers immediately, shrinking
    /// it lets the surplus retire once idle. At least one core worker is kept
    /// so queued jobs always get picked up.
    pub fn set_core_pool_size(&self, size: usize) -> Result<(), ExecutorError> {
        let max_size = self.max_pool_size();
        if size == 0 || size > max_size {
            return Err(ExecutorError::InvalidPoolSize {
                core: size,
                max: max_size,
            });
        }
        self.shared.core_pool_size.store(size, Ordering::SeqCst);
        while self.pool_size() < size && !self.is_shutdown() {
            if self.add_worker(size, None).is_err() {
                break;
            }
        }
        Ok(())
    }

    pub fn set_max_pool_size(&self, size: usize) -> Result<(), ExecutorError> {
        let core_size = self.core_pool_size();
        if size == 0 || size < core_size {
            return Err(ExecutorError::InvalidPoolSize {
                core: core_size,
                max: size,
            });
        }
        self.shared.max_pool_size.store(size, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_keep_alive(&self, keep_alive: Duration) {
        self.shared
            .keep_alive_ms
            .store(keep_alive.as_millis() as u64, Ordering::Relaxed);
    }

    /// Reserve a worker slot below `limit` and spawn a thread for it. On
    /// failure `first_job` is handed back to the caller.
    fn add_worker(&self, limit: usize, first_job: Option<Job>) -> Result<(), Option<Job>> {
        if self
            .shared
            .pool_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                (size < limit).then_some(size + 1)
            })
            .is_err()
        {
            return Err(first_job);
        }

        let index = self.shared.thread_counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_{}", self.shared.thread_name_prefix, index);
        let handoff = Arc::new(Mutex::new(first_job));
        let worker_handoff = handoff.clone();
        let shared = self.shared.clone();

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let first_job = worker_handoff.lock().take();
            worker_loop(shared, first_job)
        });

        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                self.shared.pool_size.fetch_sub(1, Ordering::SeqCst);
                error!(thread = name.as_str(), error = %err, "Failed to spawn worker");
                let job = handoff.lock().take();
                Err(job)
            },
        }
    }
}

impl std::fmt::Debug for BoundedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedExecutor")
            .field("prefix", &self.shared.thread_name_prefix)
            .field("core_pool_size", &self.core_pool_size())
            .field("max_pool_size", &self.max_pool_size())
            .field("pool_size", &self.pool_size())
            .field("queued", &self.queued_count())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
