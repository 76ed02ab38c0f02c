use super::{
    errors::{ConfigError, SubmitError},
    model::PoolMetrics,
};
use std::{
    env,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use crossbeam::deque::{Injector, Steal};
use futures::FutureExt;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time::Duration,
};
use tokio_util::{
    sync::CancellationToken,
    task::TaskTracker,
};


pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pool and deadline configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    /// Tasks that may wait in the queue before `submit` starts blocking.
    pub queue_capacity: usize,
    pub task_timeout: Duration,
    /// Wait between scope cancellation and the forced abort of a blocked resource.
    pub grace: Duration,
    /// Extra wait after `grace` before a call that was never aborted is detached.
    pub settle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let workers = num_cpus::get() * 2; // blocking I/O bound
        Self {
            workers,
            queue_capacity: workers,
            task_timeout: Duration::from_secs(1),
            grace: Duration::from_millis(100),
            settle: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus,
            queue_capacity: num_cpus * 10,
            ..Default::default()
        }
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus * 4,
            queue_capacity: num_cpus * 4,
            task_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Defaults overlaid with `DEADLINE_POOL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<u64>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(value) => value.trim().parse::<u64>().map(Some).map_err(|_| {
                    ConfigError::InvalidEnv { key: key.to_string(), value }
                }),
            }
        };

        let mut config = Config::default();
        if let Some(workers) = parse("DEADLINE_POOL_WORKERS")? {
            config.workers = workers as usize;
            config.queue_capacity = config.workers;
        }
        if let Some(capacity) = parse("DEADLINE_POOL_QUEUE")? {
            config.queue_capacity = capacity as usize;
        }
        if let Some(ms) = parse("DEADLINE_POOL_TIMEOUT_MS")? {
            config.task_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse("DEADLINE_POOL_GRACE_MS")? {
            config.grace = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }
}


pub type WorkerPool = Arc<WorkerPoolInner>;

struct Queued {
    task: Task,
    // Released as soon as a worker takes the task, which unblocks one `submit`.
    _slot: OwnedSemaphorePermit,
}

/// Fixed set of workers draining a bounded queue until the root token fires.
pub struct WorkerPoolInner {
    inject: Injector<Queued>,
    notify: Notify,
    slots: Arc<Semaphore>,
    root: CancellationToken,
    tracker: TaskTracker,
    workers: usize,
    idle_workers: AtomicUsize,
    active_tasks: AtomicUsize,
    queued_tasks: AtomicUsize,
}

impl WorkerPoolInner {
    /// Queue capacity equals the worker count.
    pub fn new(root: CancellationToken, workers: usize) -> Result<WorkerPool, ConfigError> {
        let config = Config {
            workers,
            queue_capacity: workers.max(1),
            ..Default::default()
        };
        Self::with_config(root, &config)
    }

    /// Must be called from within a tokio runtime.
    pub fn with_config(root: CancellationToken, config: &Config) -> Result<WorkerPool, ConfigError> {
        config.validate()?;

        let pool = Arc::new(WorkerPoolInner {
            inject: Injector::new(),
            notify: Notify::new(),
            slots: Arc::new(Semaphore::new(config.queue_capacity)),
            root,
            tracker: TaskTracker::new(),
            workers: config.workers,
            idle_workers: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            queued_tasks: AtomicUsize::new(0),
        });

        for id in 0..config.workers {
            let pool_clone = pool.clone();
            pool.tracker.spawn(async move {
                pool_clone.worker_loop(id).await;
            });
        }
        pool.tracker.close();

        tracing::debug!(
            workers = config.workers,
            capacity = config.queue_capacity,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Enqueues a task, waiting for a free slot while the queue is full.
    ///
    /// Fails with [`SubmitError::Closed`] once the root token has fired. A task
    /// that was accepted but not yet picked up when the root token fires is
    /// dropped without running.
    pub async fn submit<F>(&self, fut: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            return Err(SubmitError::Closed);
        }
        let slot = tokio::select! {
            biased;
            _ = self.root.cancelled() => return Err(SubmitError::Closed),
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| SubmitError::Closed)?
            }
        };
        self.push_task(Queued { task: Box::pin(fut), _slot: slot });
        Ok(())
    }

    pub fn try_submit<F>(&self, fut: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            return Err(SubmitError::Closed);
        }
        let slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| SubmitError::Full)?;
        self.push_task(Queued { task: Box::pin(fut), _slot: slot });
        Ok(())
    }

    #[inline]
    fn push_task(&self, queued: Queued) {
        self.queued_tasks.fetch_add(1, Ordering::Relaxed);
        self.inject.push(queued);
        self.notify.notify_one();
    }

    fn pop_task(&self) -> Option<Queued> {
        loop {
            match self.inject.steal() {
                Steal::Success(queued) => {
                    self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
                    return Some(queued);
                }
                Steal::Empty => return None,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }

    async fn worker_loop(&self, id: usize) {
        loop {
            if self.root.is_cancelled() {
                break;
            }

            if let Some(Queued { task, _slot: slot }) = self.pop_task() {
                drop(slot);
                // Several pushes may have collapsed into one stored permit.
                if !self.inject.is_empty() {
                    self.notify.notify_one();
                }

                self.active_tasks.fetch_add(1, Ordering::Relaxed);
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    tracing::error!(worker = id, panic = %message, "task panicked");
                }
                self.active_tasks.fetch_sub(1, Ordering::Relaxed);
            } else {
                self.idle_workers.fetch_add(1, Ordering::Relaxed);
                let stop = tokio::select! {
                    biased;
                    _ = self.root.cancelled() => true,
                    _ = self.notify.notified() => false,
                };
                self.idle_workers.fetch_sub(1, Ordering::Relaxed);
                if stop {
                    break;
                }
            }
        }
        tracing::debug!(worker = id, "worker stopped");
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            workers: self.workers,
            idle_workers: self.idle_workers.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Waits until every worker has exited. Only completes after the root
    /// token fired and in-flight tasks finished.
    pub async fn closed(&self) {
        self.tracker.wait().await;
    }

    pub async fn closed_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.closed()).await.is_ok()
    }
}
