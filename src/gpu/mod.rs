//! Boundary to the GPU backend.
//!
//! The engine never issues GPU calls itself. It owns a single
//! [`GpuPipeline`] instance, constructed lazily on the managing thread of
//! pool 0 and confined to that thread for its whole life, and lends it to
//! tasks that asked for it.

use std::any::Any;

use crate::error::TaskError;

mod recycle;

pub use recycle::{Recyclable, RecycleBin};

/// Interface the execution engine needs from a GPU backend.
///
/// Deliberately not `Send`: the instance is created by the managing thread
/// of pool 0, used only from that thread and dropped with it, so GPU state
/// never has to survive a thread hop.
pub trait GpuPipeline {
    /// Vendor string reported by the backend.
    fn vendor(&self) -> String {
        "unknown".to_string()
    }

    /// Renderer string reported by the backend.
    fn renderer(&self) -> String {
        "unknown".to_string()
    }

    /// Finishes all pending GPU work. Called by the managing thread after
    /// every job that engaged the GPU, so results are complete before the
    /// submitter is unblocked.
    fn flush(&mut self) {}

    /// Access to the concrete backend, for tasks that know which one is
    /// behind the trait.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// One-shot constructor of the GPU backend.
///
/// Invoked at most once per context, on pool 0's managing thread, the first
/// time a task asks for the GPU. The closure crosses the thread boundary;
/// the pipeline it returns does not.
pub type GpuFactory = Box<dyn FnOnce() -> Result<Box<dyn GpuPipeline>, TaskError> + Send>;

/// Vendor and renderer strings of the GPU backend, captured on the GPU
/// thread by [`Context::query_gpu_info`](crate::Context::query_gpu_info).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    /// Vendor string reported by the backend.
    pub vendor: String,
    /// Renderer string reported by the backend.
    pub renderer: String,
}
