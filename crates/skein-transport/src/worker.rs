//! Bounded worker thread pool.
//!
//! Runs handler bodies on dedicated OS threads fed from one shared crossbeam
//! queue:
//!
//! ```text
//!  execute(task) ──try_send──▶ [ bounded queue ] ──▶ worker 0..N
//!        │                                              │
//!        └── RejectedTask when full / shut down         └── per-worker stats
//! ```
//!
//! A task that panics is counted as an error; the worker keeps running.

use crate::channel::{TransportError, TransportResult};
use crate::executor::{Executor, RejectedTask, Task};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads (0 = auto-detect from CPU count)
    pub num_workers: usize,
    /// Queue capacity per worker
    pub queue_capacity: usize,
    /// Thread name prefix
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            queue_capacity: 1024,
            name: "skein-worker".to_string(),
        }
    }
}

enum Job {
    Run(Task),
    Shutdown,
}

/// Worker thread statistics
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Tasks completed (including ones that panicked)
    pub tasks_processed: AtomicU64,
    /// Tasks that panicked
    pub errors: AtomicU64,
}

/// Pool-wide statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    workers: Vec<Arc<WorkerStats>>,
    rejected: AtomicU64,
    start_time: Option<Instant>,
}

impl PoolStats {
    /// Total tasks processed across all workers
    pub fn total_tasks(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.tasks_processed.load(Ordering::Relaxed))
            .sum()
    }

    /// Total panicking tasks across all workers
    pub fn total_errors(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.errors.load(Ordering::Relaxed))
            .sum()
    }

    /// Tasks refused at submission
    pub fn total_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Throughput in tasks per second since the pool started
    pub fn tasks_per_second(&self) -> f64 {
        match self.start_time {
            Some(start) => {
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    self.total_tasks() as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }
}

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    workers: Mutex<Vec<Worker>>,
    num_workers: usize,
    task_tx: Sender<Job>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Start a pool with the given configuration.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` if the queue capacity is zero,
    /// or `TransportError::Io` if a worker thread cannot be spawned.
    pub fn new(config: WorkerConfig) -> TransportResult<Self> {
        if config.queue_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }

        let num_workers = if config.num_workers == 0 {
            num_cpus::get()
        } else {
            config.num_workers
        };

        info!(
            "Creating worker pool with {} workers (queue capacity: {})",
            num_workers, config.queue_capacity
        );

        let (task_tx, task_rx) = bounded(config.queue_capacity * num_workers);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(num_workers);
        let mut worker_stats = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let stats = Arc::new(WorkerStats::default());
            worker_stats.push(Arc::clone(&stats));
            workers.push(Worker::spawn(
                id,
                &config.name,
                task_rx.clone(),
                Arc::clone(&shutdown),
                stats,
            )?);
        }

        Ok(Self {
            workers: Mutex::new(workers),
            num_workers,
            task_tx,
            shutdown,
            stats: Arc::new(PoolStats {
                workers: worker_stats,
                rejected: AtomicU64::new(0),
                start_time: Some(Instant::now()),
            }),
        })
    }

    /// Pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Number of worker threads
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Stop accepting tasks, let queued tasks finish, and join all workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        info!("Shutting down worker pool with {} workers", workers.len());

        for _ in 0..workers.len() {
            let _ = self.task_tx.send(Job::Shutdown);
        }

        for worker in workers {
            if let Err(e) = worker.handle.join() {
                error!("Worker {} failed to join: {:?}", worker.id, e);
            }
        }

        info!("Worker pool shutdown complete");
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) -> Result<(), RejectedTask> {
        if self.shutdown.load(Ordering::Acquire) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RejectedTask::new("worker pool is shutting down"));
        }

        self.task_tx.try_send(Job::Run(task)).map_err(|_| {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            RejectedTask::new("worker queue is full")
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(
        id: usize,
        name: &str,
        task_rx: Receiver<Job>,
        shutdown: Arc<AtomicBool>,
        stats: Arc<WorkerStats>,
    ) -> TransportResult<Self> {
        let handle = thread::Builder::new()
            .name(format!("{}-{}", name, id))
            .spawn(move || {
                debug!("Worker {} starting", id);

                loop {
                    match task_rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(Job::Run(task)) => {
                            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                                stats.errors.fetch_add(1, Ordering::Relaxed);
                                warn!("Worker {} task panicked", id);
                            }
                            stats.tasks_processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Job::Shutdown) => {
                            debug!("Worker {} received shutdown signal", id);
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            warn!("Worker {} task channel disconnected", id);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if shutdown.load(Ordering::Acquire) && task_rx.is_empty() {
                                break;
                            }
                        }
                    }
                }

                debug!(
                    "Worker {} shutting down (processed {} tasks, {} errors)",
                    id,
                    stats.tasks_processed.load(Ordering::Relaxed),
                    stats.errors.load(Ordering::Relaxed)
                );
            })?;

        Ok(Self { id, handle })
    }
}
