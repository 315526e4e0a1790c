//! Deferred destruction of GPU-backed resources.
//!
//! GPU handles may only be destroyed on the thread owning the pipeline.
//! Resources released anywhere else are staged in a [`RecycleBin`] and
//! destroyed later by an internal task running on the GPU thread.

use std::mem;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use super::GpuPipeline;
use crate::context::{Context, DEFAULT_POOL};
use crate::error::{Result, TaskError};
use crate::task::{DeviceRequirement, Task, TaskThread};

/// A resource backed by a GPU handle that must be destroyed on the GPU
/// thread.
pub trait Recyclable: Send {
    /// Destroys the resource. Called exactly once, on the managing thread
    /// of pool 0, with the GPU pipeline engaged.
    fn release(self: Box<Self>, gpu: &mut dyn GpuPipeline);
}

/// Staging area for GPU-backed resources awaiting destruction.
///
/// Any thread may [`put`](RecycleBin::put) items in; they are held until
/// [`empty`](RecycleBin::empty) runs an internal task that releases them
/// on the GPU thread.
pub struct RecycleBin {
    items: Arc<Mutex<Vec<Box<dyn Recyclable>>>>,
}

impl RecycleBin {
    pub(crate) fn new() -> RecycleBin {
        RecycleBin {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Stages a resource for destruction on the GPU thread.
    pub fn put(&self, item: Box<dyn Recyclable>) {
        self.items.lock().push(item);
    }

    /// Stages several resources at once.
    pub fn put_many(&self, items: Vec<Box<dyn Recyclable>>) {
        self.items.lock().extend(items);
    }

    /// Number of staged items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the bin holds no staged items.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Destroys all staged items by running an internal task in pool 0 of
    /// the given context, blocking until done. Does nothing when the bin
    /// is empty. Without a usable GPU the items stay staged, since only
    /// the GPU thread may destroy them.
    ///
    /// The bin is not locked while the task runs; items staged meanwhile
    /// are picked up too if they arrive before the drain.
    ///
    /// # Errors
    ///
    /// Any failure recorded by pool 0 while the internal task ran.
    pub fn empty(&self, context: &Context) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let recycler = Arc::new(Recycler {
            items: Arc::clone(&self.items),
        });
        context.perform_task(recycler, DEFAULT_POOL)?;
        Ok(())
    }
}

impl Drop for RecycleBin {
    fn drop(&mut self) {
        let staged = self.items.lock().len();
        if staged > 0 {
            warn!("Recycle bin dropped with {staged} items never released");
        }
    }
}

/// Internal task draining the staged items on the GPU thread.
struct Recycler {
    items: Arc<Mutex<Vec<Box<dyn Recyclable>>>>,
}

impl Task for Recycler {
    fn device_requirement(&self) -> DeviceRequirement {
        DeviceRequirement::GpuOrCpu
    }

    fn run(&self, _thread: &dyn TaskThread) -> std::result::Result<bool, TaskError> {
        // No GPU engaged: the items cannot be destroyed here and stay
        // staged.
        let staged = self.items.lock().len();
        if staged > 0 {
            debug!("No GPU engaged, keeping {staged} staged items");
        }
        Ok(true)
    }

    fn run_gpu(
        &self,
        gpu: &mut dyn GpuPipeline,
        _thread: &dyn TaskThread,
    ) -> std::result::Result<bool, TaskError> {
        let drained = mem::take(&mut *self.items.lock());
        debug!("Releasing {} staged items", drained.len());
        for item in drained {
            item.release(gpu);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Recyclable for Noop {
        fn release(self: Box<Self>, _gpu: &mut dyn GpuPipeline) {}
    }

    #[test]
    fn staging_counts_items() {
        let bin = RecycleBin::new();
        assert!(bin.is_empty());
        bin.put(Box::new(Noop));
        let more: Vec<Box<dyn Recyclable>> = vec![Box::new(Noop), Box::new(Noop)];
        bin.put_many(more);
        assert_eq!(bin.len(), 3);
        assert!(!bin.is_empty());
    }
}
