//! Worker pools running tasks.
//!
//! A pool owns a fixed set of persistent OS threads. The thread with
//! ordinal 0 is the managing thread: it picks jobs off the FIFO queue,
//! prepares each run, takes part in it, and finalizes it. The remaining
//! threads are secondary workers woken per job. Pool 0's managing thread
//! additionally owns the GPU pipeline when one is configured.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Sender;
use log::{debug, error};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::context::PoolIndex;
use crate::error::{PoolError, Result, TaskError};
use crate::gpu::GpuFactory;
use crate::task::{valid_worker_count, Task};

mod worker;

use worker::Command;

/// Identifier of a job scheduled on a pool.
///
/// Job numbers grow monotonically within a pool and are never reused, so a
/// handle kept after its job finished stays harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Job(u64);

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a job is run once fetched from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionMode {
    /// Run each body once.
    Normal,
    /// Re-run the bodies until the task asks to stop or the job is aborted.
    Persistent,
}

/// A queued task together with its job number and execution mode.
#[derive(Clone)]
pub(crate) struct JobEntry {
    pub(crate) id: Job,
    pub(crate) task: Arc<dyn Task>,
    pub(crate) mode: ExecutionMode,
}

/// Receiver of scheduler events.
///
/// All callbacks have no-op defaults; implement the ones of interest. They
/// are invoked synchronously from pool threads, so implementations should
/// return quickly and must not block on the pool that called them.
pub trait EventListener: Send + Sync {
    /// A worker thread has started in the given pool.
    fn thread_created(&self, pool: PoolIndex) {
        let _ = pool;
    }

    /// A worker thread of the given pool is about to exit.
    fn thread_terminating(&self, pool: PoolIndex) {
        let _ = pool;
    }

    /// A job finished or was aborted. Returning `true` asks the pool to run
    /// the same job once more instead of dropping it.
    fn task_done(&self, pool: PoolIndex, task: &Arc<dyn Task>, aborted: bool) -> bool {
        let _ = (pool, task, aborted);
        false
    }

    /// A job failed. The error is also recorded in the pool and surfaces
    /// through [`Context::check`](crate::Context::check).
    fn task_fail(&self, pool: PoolIndex, task: &Arc<dyn Task>, error: &PoolError) {
        let _ = (pool, task, error);
    }

    /// GPU initialization was attempted and failed.
    fn gpu_init_fail(&self, pool: PoolIndex, error: &TaskError) {
        let _ = (pool, error);
    }
}

/// Shared slot holding the installed event listener, if any.
///
/// Kept behind its own lock so the listener can be swapped while pools are
/// running; each event reads the current occupant.
pub(crate) struct ListenerHub {
    slot: RwLock<Option<Arc<dyn EventListener>>>,
}

impl ListenerHub {
    pub(crate) fn new(initial: Option<Arc<dyn EventListener>>) -> ListenerHub {
        ListenerHub {
            slot: RwLock::new(initial),
        }
    }

    pub(crate) fn set(&self, listener: Arc<dyn EventListener>) {
        *self.slot.write() = Some(listener);
    }

    pub(crate) fn clear(&self) {
        *self.slot.write() = None;
    }

    fn current(&self) -> Option<Arc<dyn EventListener>> {
        self.slot.read().clone()
    }

    pub(crate) fn thread_created(&self, pool: PoolIndex) {
        if let Some(listener) = self.current() {
            listener.thread_created(pool);
        }
    }

    pub(crate) fn thread_terminating(&self, pool: PoolIndex) {
        if let Some(listener) = self.current() {
            listener.thread_terminating(pool);
        }
    }

    pub(crate) fn task_done(&self, pool: PoolIndex, task: &Arc<dyn Task>, aborted: bool) -> bool {
        match self.current() {
            Some(listener) => listener.task_done(pool, task, aborted),
            None => false,
        }
    }

    pub(crate) fn task_fail(&self, pool: PoolIndex, task: &Arc<dyn Task>, error: &PoolError) {
        if let Some(listener) = self.current() {
            listener.task_fail(pool, task, error);
        }
    }

    pub(crate) fn gpu_init_fail(&self, pool: PoolIndex, error: &TaskError) {
        if let Some(listener) = self.current() {
            listener.gpu_init_fail(pool, error);
        }
    }
}

/// Job queue state, guarded by one mutex.
struct JobQueue {
    /// Pending jobs in submission order. The running job stays at the front
    /// until it completes.
    entries: VecDeque<JobEntry>,
    /// Next job number to hand out.
    next_id: u64,
    /// Job currently inside a run, if any. Cleared when the job is popped.
    running: Option<Job>,
    /// Set when the running job must be run once more after this round.
    repeat: bool,
}

/// Counters of the current run, guarded by one mutex.
///
/// `hits` counts barrier arrivals of all workers together; `bound` is the
/// hit count at which the previous barrier released; `remaining` is the
/// number of participants still executing their body. A worker arriving at
/// the barrier passes when `hits >= bound + remaining`, so workers that
/// already finished never block the rest.
struct Round {
    hits: u64,
    bound: u64,
    remaining: usize,
}

/// State shared between the pool handle and its threads.
pub(crate) struct PoolCore {
    index: PoolIndex,
    queue: Mutex<JobQueue>,
    /// Signaled on every queue update: submissions, job departures.
    queue_cvar: Condvar,
    round: Mutex<Round>,
    /// Signaled on barrier progress and body completion.
    sync_cvar: Condvar,
    /// Signaled when `remaining` drops; the managing thread waits on it.
    done_cvar: Condvar,
    /// Command channels of the secondary workers, ordinal `i + 1` at slot `i`.
    senders: Mutex<Vec<Sender<Command>>>,
    worker_count: AtomicUsize,
    abort_external: AtomicBool,
    abort_internal: AtomicBool,
    fail: AtomicBool,
    shutdown: AtomicBool,
    gpu_queried: AtomicBool,
    gpu_ready: AtomicBool,
    /// Failures recorded by this pool, oldest first.
    errors: Mutex<VecDeque<PoolError>>,
    listener: Arc<ListenerHub>,
}

impl PoolCore {
    fn push_error(&self, error: PoolError) {
        self.errors.lock().push_back(error);
    }
}

/// A pool of persistent worker threads executing tasks.
pub(crate) struct TaskPool {
    core: Arc<PoolCore>,
    manager: Mutex<Option<JoinHandle<()>>>,
    /// Join handles of the secondary workers, parallel to `core.senders`.
    secondaries: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Spawns a pool with the given worker count. The GPU factory, when
    /// present, is handed to the managing thread and invoked lazily.
    pub(crate) fn new(
        index: PoolIndex,
        workers: usize,
        gpu_factory: Option<GpuFactory>,
        listener: Arc<ListenerHub>,
    ) -> TaskPool {
        let workers = valid_worker_count(workers);
        let core = Arc::new(PoolCore {
            index,
            queue: Mutex::new(JobQueue {
                entries: VecDeque::new(),
                next_id: 1,
                running: None,
                repeat: false,
            }),
            queue_cvar: Condvar::new(),
            round: Mutex::new(Round {
                hits: 0,
                bound: 0,
                remaining: 0,
            }),
            sync_cvar: Condvar::new(),
            done_cvar: Condvar::new(),
            senders: Mutex::new(Vec::new()),
            worker_count: AtomicUsize::new(workers),
            abort_external: AtomicBool::new(false),
            abort_internal: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            gpu_queried: AtomicBool::new(false),
            gpu_ready: AtomicBool::new(false),
            errors: Mutex::new(VecDeque::new()),
            listener,
        });

        let manager = worker::spawn_manager(Arc::clone(&core), gpu_factory);
        let mut handles = Vec::with_capacity(workers.saturating_sub(1));
        {
            let mut senders = core.senders.lock();
            for ordinal in 1..workers {
                let (handle, sender) = worker::spawn_secondary(Arc::clone(&core), ordinal);
                senders.push(sender);
                handles.push(handle);
            }
        }
        debug!("Pool {index} started with {workers} workers");

        TaskPool {
            core,
            manager: Mutex::new(Some(manager)),
            secondaries: Mutex::new(handles),
        }
    }

    /// Appends a job to the queue and returns its number.
    pub(crate) fn submit(&self, task: Arc<dyn Task>, mode: ExecutionMode) -> Job {
        let job = {
            let mut queue = self.core.queue.lock();
            let job = Job(queue.next_id);
            queue.next_id += 1;
            queue.entries.push_back(JobEntry { id: job, task, mode });
            job
        };
        self.core.queue_cvar.notify_all();
        debug!("Pool {}: job {job} submitted", self.core.index);
        job
    }

    /// Ensures the task runs at least once more.
    ///
    /// If the task is currently running, its job is flagged for one more
    /// run after the current round (several calls coalesce into one), and
    /// `abort_current` additionally aborts the round in progress. If the
    /// task is already queued, nothing changes. Otherwise the task is
    /// submitted as a normal job.
    pub(crate) fn repeat(&self, task: &Arc<dyn Task>, abort_current: bool) -> Job {
        let job = {
            let mut queue = self.core.queue.lock();
            let front = queue
                .entries
                .front()
                .filter(|entry| Arc::ptr_eq(&entry.task, task))
                .map(|entry| entry.id);
            if let Some(id) = front {
                if queue.running == Some(id) {
                    queue.repeat = true;
                    if abort_current {
                        self.core.abort_external.store(true, Ordering::SeqCst);
                    }
                }
                return id;
            }
            if let Some(id) = queue
                .entries
                .iter()
                .find(|entry| Arc::ptr_eq(&entry.task, task))
                .map(|entry| entry.id)
            {
                return id;
            }
            let job = Job(queue.next_id);
            queue.next_id += 1;
            queue.entries.push_back(JobEntry {
                id: job,
                task: Arc::clone(task),
                mode: ExecutionMode::Normal,
            });
            job
        };
        self.core.queue_cvar.notify_all();
        debug!("Pool {}: job {job} submitted for repetition", self.core.index);
        job
    }

    /// Blocks until the given job is no longer in the queue.
    pub(crate) fn wait_for_job(&self, job: Job) {
        let mut queue = self.core.queue.lock();
        #[cfg(debug_assertions)]
        {
            // Guards against waiting behind a persistent job that nobody is
            // stopping: it would never leave the queue.
            if let Some(running) = queue.running {
                let blocking_persistent = running != job
                    && !self.core.abort_external.load(Ordering::SeqCst)
                    && queue
                        .entries
                        .front()
                        .map_or(false, |entry| {
                            entry.id == running && entry.mode == ExecutionMode::Persistent
                        });
                if blocking_persistent {
                    panic!("waiting behind a running persistent job: potential deadlock");
                }
            }
        }
        while queue.entries.iter().any(|entry| entry.id == job) {
            self.core.queue_cvar.wait(&mut queue);
        }
    }

    /// Aborts a job. Returns `true` if the job was running and got
    /// interrupted, `false` if it was dropped from the queue before
    /// starting or already finished.
    pub(crate) fn abort_job(&self, job: Job) -> bool {
        let mut queue = self.core.queue.lock();
        if queue.running == Some(job) {
            self.core.abort_external.store(true, Ordering::SeqCst);
            while queue.running == Some(job) {
                self.core.queue_cvar.wait(&mut queue);
            }
            return true;
        }
        if let Some(at) = queue.entries.iter().position(|entry| entry.id == job) {
            queue.entries.remove(at);
            // Threads in `wait_for_job` or `wait` watch the queue contents
            // and must observe the departure.
            drop(queue);
            self.core.queue_cvar.notify_all();
            return false;
        }
        false
    }

    /// Blocks until the queue is empty.
    pub(crate) fn wait(&self) {
        let mut queue = self.core.queue.lock();
        while !queue.entries.is_empty() {
            self.core.queue_cvar.wait(&mut queue);
        }
    }

    /// Whether the pool currently has queued or running jobs.
    pub(crate) fn busy(&self) -> bool {
        !self.core.queue.lock().entries.is_empty()
    }

    /// Takes the oldest failure recorded by this pool, if any.
    ///
    /// Failures queue up; every call reports one of them, oldest first.
    pub(crate) fn check(&self) -> Result<()> {
        match self.core.errors.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Current number of worker threads.
    pub(crate) fn worker_count(&self) -> usize {
        self.core.worker_count.load(Ordering::SeqCst)
    }

    /// Whether GPU initialization has been attempted in this pool.
    pub(crate) fn is_gpu_queried(&self) -> bool {
        self.core.gpu_queried.load(Ordering::SeqCst)
    }

    /// Whether the GPU is initialized and usable in this pool.
    pub(crate) fn is_gpu_ready(&self) -> bool {
        self.core.gpu_ready.load(Ordering::SeqCst)
    }

    /// Whether the calling thread is this pool's managing thread.
    pub(crate) fn is_managing_thread(&self) -> bool {
        let current = thread::current().id();
        self.manager
            .lock()
            .as_ref()
            .map_or(false, |handle| handle.thread().id() == current)
    }

    /// Whether the calling thread belongs to this pool.
    fn owns_current_thread(&self) -> bool {
        if self.is_managing_thread() {
            return true;
        }
        let current = thread::current().id();
        self.secondaries
            .lock()
            .iter()
            .any(|handle| handle.thread().id() == current)
    }

    /// Changes the number of worker threads.
    ///
    /// Waits for the queue to drain first; submissions arriving meanwhile
    /// are blocked until the change is done. Surplus workers are stopped
    /// and joined; missing ones are spawned.
    ///
    /// # Errors
    ///
    /// [`PoolError::ResizeFromWorker`] when called from one of this pool's
    /// own threads, which could never finish draining the queue.
    pub(crate) fn resize(&self, workers: usize) -> Result<()> {
        if self.owns_current_thread() {
            return Err(PoolError::ResizeFromWorker);
        }
        let workers = valid_worker_count(workers);
        if workers == self.core.worker_count.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut queue = self.core.queue.lock();
        while !queue.entries.is_empty() {
            self.core.queue_cvar.wait(&mut queue);
        }

        let previous = self.core.worker_count.load(Ordering::SeqCst);
        let mut senders = self.core.senders.lock();
        let mut handles = self.secondaries.lock();
        if workers < previous {
            for sender in senders.drain(workers - 1..) {
                let _ = sender.send(Command::Stop);
            }
            for handle in handles.drain(workers - 1..) {
                if handle.join().is_err() {
                    error!("Pool {}: worker panicked while stopping", self.core.index);
                }
            }
        } else {
            for ordinal in previous..workers {
                let (handle, sender) = worker::spawn_secondary(Arc::clone(&self.core), ordinal);
                senders.push(sender);
                handles.push(handle);
            }
        }
        self.core.worker_count.store(workers, Ordering::SeqCst);
        debug!("Pool {}: resized from {previous} to {workers} workers", self.core.index);
        Ok(())
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        self.core.abort_external.store(true, Ordering::SeqCst);
        // Lock and release each mutex so threads observing the flags inside
        // a wait cannot miss the wakeup.
        drop(self.core.queue.lock());
        self.core.queue_cvar.notify_all();
        drop(self.core.round.lock());
        self.core.sync_cvar.notify_all();
        self.core.done_cvar.notify_all();
        {
            let senders = self.core.senders.lock();
            for sender in senders.iter() {
                let _ = sender.send(Command::Stop);
            }
        }
        if let Some(handle) = self.manager.lock().take() {
            if handle.join().is_err() {
                error!("Pool {}: managing thread panicked", self.core.index);
            }
        }
        for handle in self.secondaries.lock().drain(..) {
            if handle.join().is_err() {
                error!("Pool {}: worker panicked while stopping", self.core.index);
            }
        }
        debug!("Pool {} stopped", self.core.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskThread;

    struct Count {
        hits: AtomicUsize,
    }

    impl Count {
        fn new() -> Count {
            Count {
                hits: AtomicUsize::new(0),
            }
        }
    }

    impl Task for Count {
        fn run(&self, _thread: &dyn TaskThread) -> std::result::Result<bool, TaskError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[test]
    fn runs_a_submitted_job() {
        let pool = TaskPool::new(0, 2, None, Arc::new(ListenerHub::new(None)));
        let task = Arc::new(Count::new());
        let job = pool.submit(task.clone(), ExecutionMode::Normal);
        pool.wait_for_job(job);
        assert!(pool.check().is_ok());
        assert_eq!(task.hits.load(Ordering::SeqCst), 1);
        assert!(!pool.busy());
    }

    #[test]
    fn job_numbers_grow() {
        let pool = TaskPool::new(0, 1, None, Arc::new(ListenerHub::new(None)));
        let task: Arc<dyn Task> = Arc::new(Count::new());
        let first = pool.submit(Arc::clone(&task), ExecutionMode::Normal);
        let second = pool.submit(Arc::clone(&task), ExecutionMode::Normal);
        assert_ne!(first, second);
        assert_eq!(format!("{first}/{second}"), "1/2");
        pool.wait();
    }

    #[test]
    fn aborting_a_finished_job_is_a_no_op() {
        let pool = TaskPool::new(0, 2, None, Arc::new(ListenerHub::new(None)));
        let task = Arc::new(Count::new());
        let job = pool.submit(task.clone(), ExecutionMode::Normal);
        pool.wait_for_job(job);
        assert!(!pool.abort_job(job));
        assert_eq!(task.hits.load(Ordering::SeqCst), 1);
    }
}
