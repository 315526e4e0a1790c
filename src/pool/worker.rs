//! Thread bodies of a pool: the managing thread, the secondary workers and
//! the mid-task synchronization barrier.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error};

use super::{ExecutionMode, JobEntry, PoolCore};
use crate::context::DEFAULT_POOL;
use crate::error::{Interrupted, PoolError, TaskError};
use crate::gpu::{GpuFactory, GpuPipeline};
use crate::task::{valid_worker_count, DeviceRequirement, Task, TaskThread};

/// Command sent to a secondary worker.
pub(crate) enum Command {
    /// Take part in the job at the queue head, `participating` workers in
    /// total.
    Run {
        entry: JobEntry,
        participating: usize,
    },
    /// Exit the worker loop.
    Stop,
}

/// Spawns the managing thread of a pool (ordinal 0).
pub(crate) fn spawn_manager(
    core: Arc<PoolCore>,
    gpu_factory: Option<GpuFactory>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("pool{}-worker-0", core.index))
        .spawn(move || managing_thread(core, gpu_factory))
        .expect("failed to spawn worker thread")
}

/// Spawns a secondary worker and returns its command channel.
pub(crate) fn spawn_secondary(
    core: Arc<PoolCore>,
    ordinal: usize,
) -> (JoinHandle<()>, Sender<Command>) {
    let (tx, rx) = channel::unbounded();
    let handle = thread::Builder::new()
        .name(format!("pool{}-worker-{ordinal}", core.index))
        .spawn(move || secondary_thread(core, ordinal, rx))
        .expect("failed to spawn worker thread");
    (handle, tx)
}

/// Worker-side view of the run in progress, handed to task bodies.
struct RunThread<'a> {
    core: &'a PoolCore,
    ordinal: usize,
    participating: usize,
}

impl TaskThread for RunThread<'_> {
    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn worker_count(&self) -> usize {
        self.participating
    }

    fn is_aborted(&self) -> bool {
        self.core.abort_external.load(Ordering::SeqCst)
    }

    fn synchronize(&self) -> Result<(), Interrupted> {
        if self.participating > 1 {
            barrier(self.core)
        } else {
            Ok(())
        }
    }
}

/// Blocks until every participant of the current run reaches the barrier.
///
/// A worker passes when the total hit count reaches the previous release
/// bound plus the number of workers still in their body, so participants
/// that already finished are not waited for. The wait ignores the abort
/// flags: an aborted run stays synchronized until its bodies return.
fn barrier(core: &PoolCore) -> Result<(), Interrupted> {
    {
        let mut round = core.round.lock();
        round.hits += 1;
        if round.hits >= round.bound + round.remaining as u64 {
            // Last one in: advance the bound and release the others
            // without blocking.
            round.bound = round.hits;
            drop(round);
            core.sync_cvar.notify_all();
        } else {
            let my_bound = round.bound;
            while !core.shutdown.load(Ordering::SeqCst)
                && !core.fail.load(Ordering::SeqCst)
                && my_bound + round.remaining as u64 > round.hits
            {
                core.sync_cvar.wait(&mut round);
            }
        }
    }
    if core.fail.load(Ordering::SeqCst) {
        Err(Interrupted)
    } else {
        Ok(())
    }
}

/// Converts a panic payload into a displayable message.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Records a failure of the current job: flags the run as failed, informs
/// the listener and queues the error for later collection.
fn report_failure(core: &PoolCore, task: &Arc<dyn Task>, error: PoolError) {
    error!("Pool {}: {error}", core.index);
    core.fail.store(true, Ordering::SeqCst);
    core.listener.task_fail(core.index, task, &error);
    core.push_error(error);
}

/// Routes the outcome of a task hook. [`Interrupted`] echoes are swallowed:
/// the worker that actually failed has already reported.
fn harvest(
    core: &PoolCore,
    task: &Arc<dyn Task>,
    outcome: thread::Result<Result<(), TaskError>>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            if !error.is::<Interrupted>() {
                report_failure(core, task, PoolError::TaskFailed(error));
            }
        }
        Err(payload) => {
            report_failure(core, task, PoolError::TaskPanicked(panic_message(&*payload)));
        }
    }
}

/// Runs the CPU body of a job on one worker, looping for persistent jobs.
/// Errors and panics are contained to the job.
fn run_cpu_body(core: &PoolCore, entry: &JobEntry, thread: &RunThread<'_>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(), TaskError> {
        loop {
            if !entry.task.run(thread)? {
                core.abort_internal.store(true, Ordering::SeqCst);
            }
            if entry.mode != ExecutionMode::Persistent
                || core.abort_internal.load(Ordering::SeqCst)
                || core.abort_external.load(Ordering::SeqCst)
                || core.shutdown.load(Ordering::SeqCst)
            {
                return Ok(());
            }
        }
    }));
    harvest(core, &entry.task, outcome);
}

/// Signs one participant off the current run. Barrier waiters recheck
/// their release condition; the managing thread rechecks for completion.
fn finish_participation(core: &PoolCore) {
    {
        let mut round = core.round.lock();
        round.remaining -= 1;
    }
    core.sync_cvar.notify_all();
    core.done_cvar.notify_all();
}

/// Secondary worker loop: wait for a command, run the body, sign off.
fn secondary_thread(core: Arc<PoolCore>, ordinal: usize, commands: Receiver<Command>) {
    core.listener.thread_created(core.index);
    debug!("Pool {}: worker {ordinal} up", core.index);
    loop {
        match commands.recv() {
            Ok(Command::Run {
                entry,
                participating,
            }) => {
                let thread = RunThread {
                    core: &core,
                    ordinal,
                    participating,
                };
                run_cpu_body(&core, &entry, &thread);
                finish_participation(&core);
            }
            Ok(Command::Stop) | Err(_) => break,
        }
    }
    debug!("Pool {}: worker {ordinal} exiting", core.index);
    core.listener.thread_terminating(core.index);
}

/// Managing thread loop: fetch the queue head, resolve its execution
/// target, run the round, finalize it. The GPU pipeline is a local of this
/// function, so it is created, used and dropped on this thread only.
fn managing_thread(core: Arc<PoolCore>, gpu_factory: Option<GpuFactory>) {
    core.listener.thread_created(core.index);
    let mut factory = gpu_factory;
    let mut gpu: Option<Box<dyn GpuPipeline>> = None;

    loop {
        // Fetch the queue head; it stays in the queue until done. Round
        // counters and flags are reset while holding the queue lock so
        // submitters and aborters see a consistent state.
        let fetched = {
            let mut queue = core.queue.lock();
            while queue.entries.is_empty() && !core.shutdown.load(Ordering::SeqCst) {
                core.queue_cvar.wait(&mut queue);
            }
            if core.shutdown.load(Ordering::SeqCst) {
                None
            } else {
                match queue.entries.front().cloned() {
                    Some(entry) => {
                        let participating = valid_worker_count(entry.task.max_workers())
                            .min(core.worker_count.load(Ordering::SeqCst));
                        queue.repeat = false;
                        queue.running = Some(entry.id);
                        core.abort_external.store(false, Ordering::SeqCst);
                        core.abort_internal.store(false, Ordering::SeqCst);
                        core.fail.store(false, Ordering::SeqCst);
                        let mut round = core.round.lock();
                        round.hits = 0;
                        round.bound = 0;
                        round.remaining = participating;
                        Some((entry, participating))
                    }
                    None => None,
                }
            }
        };
        let (entry, participating) = match fetched {
            Some(fetched) => fetched,
            None => {
                if core.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
        };

        debug!(
            "Pool {}: job {} starts on {participating} workers",
            core.index, entry.id
        );

        // Resolve the execution target. Only pool 0 may own a GPU, and it
        // is initialized on first demand.
        let requirement = entry.task.device_requirement();
        let mut engage_gpu = false;
        if requirement != DeviceRequirement::CpuOnly && core.index == DEFAULT_POOL {
            if !core.gpu_queried.load(Ordering::SeqCst) {
                match factory.take() {
                    Some(build) => match build() {
                        Ok(pipeline) => {
                            debug!("Pool {}: GPU pipeline initialized", core.index);
                            gpu = Some(pipeline);
                            core.gpu_ready.store(true, Ordering::SeqCst);
                        }
                        Err(error) => {
                            error!("Pool {}: GPU initialization failed: {error}", core.index);
                            core.listener.gpu_init_fail(core.index, &error);
                            core.push_error(PoolError::GpuInit(error));
                        }
                    },
                    None => {
                        debug!("Pool {}: no GPU backend configured", core.index);
                    }
                }
                core.gpu_queried.store(true, Ordering::SeqCst);
            }
            engage_gpu = gpu.is_some();
        }

        // Setup phase, managing thread only. A task that cannot get the
        // GPU it requires fails here, before anything ran.
        if !engage_gpu && requirement == DeviceRequirement::GpuOnly {
            let error = if core.index == DEFAULT_POOL {
                PoolError::GpuUnavailable
            } else {
                PoolError::GpuWrongPool
            };
            report_failure(&core, &entry.task, error);
        } else {
            // Reborrow through the box; the handle's borrow of the pipeline
            // ends with the call instead of pinning `gpu` for the iteration.
            let gpu_handle: Option<&mut dyn GpuPipeline> = match gpu.as_mut() {
                Some(pipeline) if engage_gpu => Some(&mut **pipeline),
                _ => None,
            };
            let outcome =
                catch_unwind(AssertUnwindSafe(|| entry.task.setup(participating, gpu_handle)));
            harvest(&core, &entry.task, outcome);
        }

        // A job failing before its bodies start is dropped right away.
        if core.fail.load(Ordering::SeqCst) {
            drop_front(&core);
            continue;
        }

        // Wake the secondary participants.
        if participating > 1 {
            let mut lost = 0;
            {
                let senders = core.senders.lock();
                for sender in senders.iter().take(participating - 1) {
                    let command = Command::Run {
                        entry: entry.clone(),
                        participating,
                    };
                    if sender.send(command).is_err() {
                        lost += 1;
                    }
                }
            }
            if lost > 0 {
                error!("Pool {}: {lost} workers unreachable", core.index);
                {
                    let mut round = core.round.lock();
                    round.remaining -= lost;
                }
                core.sync_cvar.notify_all();
                core.done_cvar.notify_all();
            }
        }

        // The managing thread takes part in the run: on the GPU when the
        // job engages it, as a regular CPU worker otherwise.
        let thread = RunThread {
            core: &core,
            ordinal: 0,
            participating,
        };
        if engage_gpu {
            let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(), TaskError> {
                loop {
                    let proceed = match gpu.as_deref_mut() {
                        Some(pipeline) => entry.task.run_gpu(pipeline, &thread)?,
                        None => entry.task.run(&thread)?,
                    };
                    if !proceed {
                        core.abort_internal.store(true, Ordering::SeqCst);
                    }
                    if entry.mode != ExecutionMode::Persistent
                        || core.abort_internal.load(Ordering::SeqCst)
                        || core.abort_external.load(Ordering::SeqCst)
                        || core.shutdown.load(Ordering::SeqCst)
                    {
                        return Ok(());
                    }
                }
            }));
            harvest(&core, &entry.task, outcome);
        } else {
            run_cpu_body(&core, &entry, &thread);
        }

        // Sign off and wait for the rest of the participants. Teardown
        // must not start while any body is still running.
        {
            let mut round = core.round.lock();
            round.remaining -= 1;
            core.sync_cvar.notify_all();
            while round.remaining > 0 {
                core.done_cvar.wait(&mut round);
            }
        }

        // Teardown phase, managing thread only.
        let aborted = core.abort_external.load(Ordering::SeqCst);
        {
            let gpu_handle: Option<&mut dyn GpuPipeline> = match gpu.as_mut() {
                Some(pipeline) if engage_gpu => Some(&mut **pipeline),
                _ => None,
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                entry.task.teardown(participating, gpu_handle, aborted)
            }));
            harvest(&core, &entry.task, outcome);
        }
        if engage_gpu {
            if let Some(pipeline) = gpu.as_deref_mut() {
                pipeline.flush();
            }
        }

        // Decide whether the job repeats or leaves the queue. The listener
        // is consulted outside the queue lock; a failed job never repeats.
        let fail = core.fail.load(Ordering::SeqCst);
        let listener_repeat = if fail {
            false
        } else {
            core.listener.task_done(core.index, &entry.task, aborted)
        };
        {
            let mut queue = core.queue.lock();
            debug_assert_eq!(queue.entries.front().map(|front| front.id), Some(entry.id));
            if (queue.repeat || listener_repeat) && !fail {
                debug!("Pool {}: job {} repeats", core.index, entry.id);
            } else {
                queue.entries.pop_front();
                queue.running = None;
                drop(queue);
                core.queue_cvar.notify_all();
                debug!("Pool {}: job {} done", core.index, entry.id);
            }
        }
    }

    debug!("Pool {}: managing thread exiting", core.index);
    core.listener.thread_terminating(core.index);
}

/// Pops the queue head and releases everyone waiting on the queue.
fn drop_front(core: &PoolCore) {
    {
        let mut queue = core.queue.lock();
        queue.entries.pop_front();
        queue.running = None;
    }
    core.queue_cvar.notify_all();
}
