use crate::error::{Interrupted, TaskError};
use crate::gpu::GpuPipeline;

/// Hard ceiling on the number of workers a pool can run.
pub const MAX_WORKER_COUNT: usize = 255;

/// Clamps a requested worker count to the valid range
/// `1..=`[`MAX_WORKER_COUNT`].
pub fn valid_worker_count(count: usize) -> usize {
    count.clamp(1, MAX_WORKER_COUNT)
}

/// Where a task is able to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequirement {
    /// The task runs on CPU workers only.
    CpuOnly,
    /// The task uses the GPU when one is available and falls back to plain
    /// CPU execution otherwise.
    GpuOrCpu,
    /// The task cannot run without a GPU.
    GpuOnly,
}

/// Per-worker handle passed to task bodies while a job is running.
///
/// It tells the body which worker it is on, how many workers run the same
/// task, and lets cooperating workers line up at a barrier in the middle of
/// the work.
pub trait TaskThread {
    /// Zero-based index of this worker within the current run.
    fn ordinal(&self) -> usize;

    /// Number of workers participating in the current run.
    fn worker_count(&self) -> usize;

    /// Whether this is the managing thread of the pool.
    fn is_managing(&self) -> bool {
        self.ordinal() == 0
    }

    /// Whether an external abort has been requested for the current job.
    /// Bodies are expected to poll this and return early when it is set.
    fn is_aborted(&self) -> bool;

    /// Blocks until every worker participating in the current run reaches
    /// the same synchronization point. A no-op when the task runs on a
    /// single worker.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] when another worker failed while running the
    /// task; propagate it with `?` so the whole run winds down. Returns
    /// `Ok(())` on pool shutdown, letting the body finish naturally.
    fn synchronize(&self) -> Result<(), Interrupted>;
}

/// A unit of work executed by a pool, possibly on several workers at once
/// and possibly on the GPU.
///
/// The pool drives every submitted task through a fixed sequence. [`setup`]
/// runs once on the managing thread. Then each participating worker runs
/// [`run`] concurrently; when the job engages the GPU, the managing thread
/// runs [`run_gpu`] instead of its CPU body. After every participant has
/// finished, [`teardown`] runs once on the managing thread. Hooks take
/// `&self`: a task keeps its per-run state behind its own interior
/// mutability and may be shared, resubmitted or repeated freely.
///
/// Any hook may fail by returning an error; the failure aborts the current
/// job only and is reported through the pool it ran on.
///
/// [`setup`]: Task::setup
/// [`run`]: Task::run
/// [`run_gpu`]: Task::run_gpu
/// [`teardown`]: Task::teardown
pub trait Task: Send + Sync {
    /// Declares where the task is able to run. Defaults to CPU only.
    fn device_requirement(&self) -> DeviceRequirement {
        DeviceRequirement::CpuOnly
    }

    /// Upper bound on the number of workers useful to this task. The pool
    /// clamps it to its own size. Defaults to a single worker.
    fn max_workers(&self) -> usize {
        1
    }

    /// Runs once on the managing thread before any body starts. `workers`
    /// is the number of participants of the coming run; `gpu` is the
    /// engaged pipeline, present only when the run targets the GPU.
    fn setup(&self, workers: usize, gpu: Option<&mut dyn GpuPipeline>) -> Result<(), TaskError> {
        let _ = (workers, gpu);
        Ok(())
    }

    /// The CPU body, executed once per participating worker. In a
    /// persistent run the pool calls it again as long as it returns
    /// `Ok(true)`; returning `Ok(false)` asks the pool to stop the whole
    /// job (internal abort).
    fn run(&self, thread: &dyn TaskThread) -> Result<bool, TaskError>;

    /// The GPU body, executed exactly once per round by the managing thread
    /// while the remaining participants run [`Task::run`]. Only called when
    /// the job engages the GPU. The return value means the same as for the
    /// CPU body.
    fn run_gpu(
        &self,
        gpu: &mut dyn GpuPipeline,
        thread: &dyn TaskThread,
    ) -> Result<bool, TaskError> {
        let _ = (gpu, thread);
        Ok(true)
    }

    /// Runs once on the managing thread after every participant has
    /// finished. `aborted` tells whether the job was aborted externally.
    fn teardown(
        &self,
        workers: usize,
        gpu: Option<&mut dyn GpuPipeline>,
        aborted: bool,
    ) -> Result<(), TaskError> {
        let _ = (workers, gpu, aborted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_clamped() {
        assert_eq!(valid_worker_count(0), 1);
        assert_eq!(valid_worker_count(1), 1);
        assert_eq!(valid_worker_count(8), 8);
        assert_eq!(valid_worker_count(100_000), MAX_WORKER_COUNT);
    }
}
