use thiserror::Error;

/// Boxed error type produced by task hooks.
///
/// Tasks report their own domain errors through this alias; the scheduler
/// wraps them into [`PoolError::TaskFailed`] when routing them to the pool
/// that ran the task.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for task pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A task hook returned an error.
    #[error("task failed: {0}")]
    TaskFailed(#[from] TaskError),

    /// A task hook panicked.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// The GPU backend could not be initialized.
    #[error("GPU initialization failed: {0}")]
    GpuInit(#[source] TaskError),

    /// A task requires the GPU, but no GPU is available in this pool.
    #[error("a task requires the GPU, but the GPU is not available")]
    GpuUnavailable,

    /// A task requiring the GPU was submitted to a pool other than pool 0.
    #[error("a task requiring the GPU may only run in the main pool")]
    GpuWrongPool,

    /// No pool exists at the given index.
    #[error("no thread pool with index {0}")]
    InvalidPool(usize),

    /// A worker count change was requested from inside the pool itself.
    #[error("cannot change the worker count from a pool-owned thread")]
    ResizeFromWorker,
}

/// Raised by the mid-task barrier when another worker running the same task
/// has failed. Task bodies propagate it with `?`; the scheduler recognizes it
/// and does not report it as a failure of its own.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("interrupted by a failure in another worker")]
pub struct Interrupted;

/// Result type alias for task pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
