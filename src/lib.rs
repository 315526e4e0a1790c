#![deny(missing_docs)]

//! Heterogeneous task execution over pools of persistent worker threads,
//! with an optional GPU confined to a single thread.
//!
//! Work is expressed as [`Task`] implementations and scheduled through a
//! [`Context`]: single runs, persistent re-execution, repetition, blocking
//! waits and cooperative aborts. Each pool is driven by its managing
//! thread, which prepares and finalizes every job; tasks spanning several
//! workers meet at a mid-run barrier through [`TaskThread::synchronize`].
//! When a GPU backend is configured, pool 0's managing thread owns the
//! pipeline, and the [`RecycleBin`] defers destruction of GPU-backed
//! resources to that thread.

mod context;
mod error;
mod gpu;
mod pool;
mod task;

pub use context::{Config, Context, PoolIndex, DEFAULT_POOL};
pub use error::{Interrupted, PoolError, Result, TaskError};
pub use gpu::{GpuFactory, GpuInfo, GpuPipeline, Recyclable, RecycleBin};
pub use pool::{EventListener, Job};
pub use task::{valid_worker_count, DeviceRequirement, Task, TaskThread, MAX_WORKER_COUNT};
