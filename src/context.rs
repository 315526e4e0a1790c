//! The execution context, front door of the engine.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;
use parking_lot::Mutex;

use crate::error::{PoolError, Result, TaskError};
use crate::gpu::{GpuFactory, GpuInfo, GpuPipeline, RecycleBin};
use crate::pool::{EventListener, ExecutionMode, Job, ListenerHub, TaskPool};
use crate::task::{valid_worker_count, DeviceRequirement, Task, TaskThread};

/// Index of a thread pool within a context.
pub type PoolIndex = usize;

/// The pool used when no particular pool is meant. It is the only pool
/// whose managing thread may own the GPU.
pub const DEFAULT_POOL: PoolIndex = 0;

/// Construction options for a [`Context`].
pub struct Config {
    /// Number of independent thread pools.
    pub pools: usize,
    /// Worker threads per pool. `0` derives a default from the number of
    /// CPUs available.
    pub workers_per_pool: usize,
    /// GPU backend constructor, invoked lazily on pool 0's managing thread
    /// the first time a task asks for the GPU.
    pub gpu: Option<GpuFactory>,
    /// Event listener installed before any thread starts, so no thread
    /// creation event is missed.
    pub listener: Option<Arc<dyn EventListener>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pools: 1,
            workers_per_pool: 0,
            gpu: None,
            listener: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("pools", &self.pools)
            .field("workers_per_pool", &self.workers_per_pool)
            .field("gpu", &self.gpu.is_some())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Entry point of the execution engine.
///
/// A context owns one or more thread pools and the GPU recycle bin. All
/// submission, waiting and cancellation goes through it. Dropping the
/// context empties the recycle bin, aborts running jobs, abandons queued
/// ones and joins all worker threads.
pub struct Context {
    pools: Vec<TaskPool>,
    listeners: Arc<ListenerHub>,
    recycle_bin: Arc<RecycleBin>,
}

impl Context {
    /// Creates a context with a single pool sized for the machine and no
    /// GPU backend.
    pub fn new() -> Context {
        Context::with_config(Config::default())
    }

    /// Creates a context from explicit options.
    pub fn with_config(config: Config) -> Context {
        let pool_count = config.pools.max(1);
        let workers = if config.workers_per_pool == 0 {
            optimal_worker_count(pool_count)
        } else {
            valid_worker_count(config.workers_per_pool)
        };
        let listeners = Arc::new(ListenerHub::new(config.listener));
        let mut gpu_factory = config.gpu;
        let pools = (0..pool_count)
            .map(|index| {
                let factory = if index == DEFAULT_POOL {
                    gpu_factory.take()
                } else {
                    None
                };
                TaskPool::new(index, workers, factory, Arc::clone(&listeners))
            })
            .collect();
        Context {
            pools,
            listeners,
            recycle_bin: Arc::new(RecycleBin::new()),
        }
    }

    fn pool(&self, pool: PoolIndex) -> Result<&TaskPool> {
        self.pools.get(pool).ok_or(PoolError::InvalidPool(pool))
    }

    /// Runs a task to completion in the given pool and returns how long
    /// the run took.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index, otherwise the
    /// oldest failure the pool recorded, as collected by
    /// [`check`](Context::check).
    pub fn perform_task(&self, task: Arc<dyn Task>, pool: PoolIndex) -> Result<Duration> {
        let target = self.pool(pool)?;
        let started = Instant::now();
        let job = target.submit(task, ExecutionMode::Normal);
        target.wait_for_job(job);
        target.check()?;
        Ok(started.elapsed())
    }

    /// Queues a task for a single run and returns its job number without
    /// waiting.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index.
    pub fn submit_task(&self, task: Arc<dyn Task>, pool: PoolIndex) -> Result<Job> {
        Ok(self.pool(pool)?.submit(task, ExecutionMode::Normal))
    }

    /// Queues a task whose bodies re-run until the task asks to stop or
    /// the job is aborted.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index.
    pub fn submit_persistent_task(&self, task: Arc<dyn Task>, pool: PoolIndex) -> Result<Job> {
        Ok(self.pool(pool)?.submit(task, ExecutionMode::Persistent))
    }

    /// Makes sure the task runs at least once more: queues it unless it is
    /// already queued, and marks it for repetition if it is running right
    /// now. With `abort_current` set, a running instance is also asked to
    /// abort so the repetition starts sooner.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index.
    pub fn repeat_task(
        &self,
        task: &Arc<dyn Task>,
        abort_current: bool,
        pool: PoolIndex,
    ) -> Result<Job> {
        Ok(self.pool(pool)?.repeat(task, abort_current))
    }

    /// Blocks until the given job is no longer queued or running. Returns
    /// immediately for unknown job numbers.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index.
    pub fn wait_for_job(&self, job: Job, pool: PoolIndex) -> Result<()> {
        self.pool(pool)?.wait_for_job(job);
        Ok(())
    }

    /// Aborts a job. A queued job is removed without running; a running
    /// one is asked to stop and waited for. Returns whether the job was
    /// running when the abort hit it.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index.
    pub fn abort_job(&self, job: Job, pool: PoolIndex) -> Result<bool> {
        Ok(self.pool(pool)?.abort_job(job))
    }

    /// Blocks until the pool queue is empty.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index.
    pub fn wait(&self, pool: PoolIndex) -> Result<()> {
        self.pool(pool)?.wait();
        Ok(())
    }

    /// Whether the pool has queued or running jobs.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index.
    pub fn busy(&self, pool: PoolIndex) -> Result<bool> {
        Ok(self.pool(pool)?.busy())
    }

    /// Collects the oldest failure recorded by the pool, if any. Each call
    /// consumes one recorded failure.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index, or the
    /// recorded failure.
    pub fn check(&self, pool: PoolIndex) -> Result<()> {
        self.pool(pool)?.check()
    }

    /// Changes the number of worker threads in a pool, blocking until the
    /// pool is idle first.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index, or
    /// [`PoolError::ResizeFromWorker`] when called from one of the pool's
    /// own threads.
    pub fn limit_worker_count(&self, max_workers: usize, pool: PoolIndex) -> Result<()> {
        self.pool(pool)?.resize(max_workers)
    }

    /// Current number of worker threads in a pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index.
    pub fn max_worker_count(&self, pool: PoolIndex) -> Result<usize> {
        Ok(self.pool(pool)?.worker_count())
    }

    /// Whether the calling thread is the managing thread of the given
    /// pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidPool`] for an unknown pool index.
    pub fn is_managing_thread(&self, pool: PoolIndex) -> Result<bool> {
        Ok(self.pool(pool)?.is_managing_thread())
    }

    /// Whether GPU availability has been settled, by a task demanding the
    /// GPU or by [`warm_up_gpu`](Context::warm_up_gpu).
    pub fn is_gpu_queried(&self) -> bool {
        self.pools[DEFAULT_POOL].is_gpu_queried()
    }

    /// Whether the GPU pipeline is initialized and usable.
    pub fn is_gpu_ready(&self) -> bool {
        self.pools[DEFAULT_POOL].is_gpu_ready()
    }

    /// Initializes the GPU pipeline right away instead of on first use.
    /// Does nothing when the pipeline is already up.
    ///
    /// # Errors
    ///
    /// [`PoolError::GpuUnavailable`] when no backend is configured, or
    /// [`PoolError::GpuInit`] when the backend failed to initialize.
    pub fn warm_up_gpu(&self) -> Result<()> {
        if self.is_gpu_ready() {
            return Ok(());
        }
        self.perform_task(Arc::new(WarmUp), DEFAULT_POOL)?;
        Ok(())
    }

    /// Describes the GPU, initializing the pipeline if needed.
    ///
    /// # Errors
    ///
    /// Same conditions as [`warm_up_gpu`](Context::warm_up_gpu).
    pub fn query_gpu_info(&self) -> Result<GpuInfo> {
        let probe = Arc::new(GpuProbe {
            info: Mutex::new(None),
        });
        self.perform_task(probe.clone(), DEFAULT_POOL)?;
        let info = probe.info.lock().take();
        info.ok_or(PoolError::GpuUnavailable)
    }

    /// Installs the listener receiving scheduler events from all pools,
    /// replacing any previous one.
    pub fn set_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.set(listener);
    }

    /// Removes the current event listener, if any.
    pub fn clear_event_listener(&self) {
        self.listeners.clear();
    }

    /// The staging area for GPU-backed resources awaiting destruction.
    pub fn recycle_bin(&self) -> &RecycleBin {
        &self.recycle_bin
    }

    /// Destroys all staged GPU-backed resources, blocking until done.
    ///
    /// # Errors
    ///
    /// Any failure recorded by pool 0 while the drain ran.
    pub fn empty_recycle_bin(&self) -> Result<()> {
        self.recycle_bin.empty(self)
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Staged GPU resources must be destroyed while the GPU thread is
        // still around.
        if !self.recycle_bin.is_empty() {
            if let Err(err) = self.recycle_bin.empty(self) {
                error!("Failed to empty the recycle bin: {err}");
            }
        }
    }
}

/// Default per-pool worker count: the available CPUs split across pools,
/// at least one each.
fn optimal_worker_count(pools: usize) -> usize {
    valid_worker_count(num_cpus::get() / pools)
}

/// Internal task forcing GPU initialization.
struct WarmUp;

impl Task for WarmUp {
    fn device_requirement(&self) -> DeviceRequirement {
        DeviceRequirement::GpuOnly
    }

    fn run(&self, _thread: &dyn TaskThread) -> std::result::Result<bool, TaskError> {
        Ok(true)
    }
}

/// Internal task capturing the GPU description on the GPU thread.
struct GpuProbe {
    info: Mutex<Option<GpuInfo>>,
}

impl Task for GpuProbe {
    fn device_requirement(&self) -> DeviceRequirement {
        DeviceRequirement::GpuOnly
    }

    fn run(&self, _thread: &dyn TaskThread) -> std::result::Result<bool, TaskError> {
        Ok(true)
    }

    fn run_gpu(
        &self,
        gpu: &mut dyn GpuPipeline,
        _thread: &dyn TaskThread,
    ) -> std::result::Result<bool, TaskError> {
        *self.info.lock() = Some(GpuInfo {
            vendor: gpu.vendor(),
            renderer: gpu.renderer(),
        });
        Ok(true)
    }
}
