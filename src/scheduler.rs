//! The task scheduler: worker threads, ready queues and the switch loop.
//!
//! Workers multiplex a fixed pool of fibers over the configured number of
//! OS threads. Each worker prefers resumable fibers (pinned first, then
//! global), falls back to pending tasks, and otherwise applies the
//! configured empty-queue behavior. Tasks reach workers through a global
//! injector with per-worker buffers and work stealing.

use std::cell::Cell;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use core_affinity::CoreId;
use crossbeam::deque::{Injector, Steal, Stealer, Worker as Deque};
use crossbeam::queue::SegQueue;

use crate::counter::AtomicCounter;
use crate::error::SchedulerError;
use crate::fiber::{self, Fiber, FiberInput, FiberStep, FiberYield};
use crate::fiber_pool::FiberPool;
use crate::task::{QueuedTask, Task};

/// Stack size for every pooled fiber.
const FIBER_STACK_SIZE: usize = 512 * 1024;

/// Injector steal attempts before deferring to peer stealing.
const MAX_STEAL_RETRIES: usize = 3;

/// What a worker does when it finds no resumable fiber and no task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyQueueBehavior {
    /// Busy-loop rechecking. Lowest wake latency, burns the CPU.
    #[default]
    Spin,
    /// Hint the OS scheduler between rechecks.
    Yield,
    /// Block on a per-worker signal released whenever work is enqueued.
    Sleep,
}

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// One-token sleep signal for a worker under [`EmptyQueueBehavior::Sleep`].
struct Signal {
    token: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new() -> Self {
        Signal {
            token: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut token = self.token.lock().unwrap();
        *token = true;
        drop(token);
        self.condvar.notify_one();
    }

    fn wait(&self) {
        let mut token = self.token.lock().unwrap();
        while !*token {
            token = self.condvar.wait(token).unwrap();
        }
        *token = false;
    }
}

/// Per-worker state reachable from any thread.
pub(crate) struct WorkerShared {
    /// Fibers whose resumption is pinned to this worker. Only this worker
    /// pops; any thread may push.
    pinned: SegQueue<Box<Fiber>>,
    signal: Signal,
}

impl WorkerShared {
    fn new() -> Self {
        WorkerShared {
            pinned: SegQueue::new(),
            signal: Signal::new(),
        }
    }
}

/// State shared by the scheduler handle, every worker, and everything the
/// scheduler hands out (counters, Fibtexes, fibers).
pub(crate) struct Shared {
    injector: Injector<QueuedTask>,
    resumable: Injector<Box<Fiber>>,
    stealers: OnceLock<Vec<Stealer<QueuedTask>>>,
    workers: OnceLock<Vec<WorkerShared>>,
    fibers: OnceLock<FiberPool>,
    behavior: OnceLock<EmptyQueueBehavior>,
    quit: AtomicBool,
    started: AtomicBool,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: crate::metrics::Metrics,
}

impl Shared {
    fn new() -> Self {
        Shared {
            injector: Injector::new(),
            resumable: Injector::new(),
            stealers: OnceLock::new(),
            workers: OnceLock::new(),
            fibers: OnceLock::new(),
            behavior: OnceLock::new(),
            quit: AtomicBool::new(false),
            started: AtomicBool::new(false),
            #[cfg(feature = "metrics")]
            metrics: crate::metrics::Metrics::new(),
        }
    }

    pub(crate) fn fiber_pool(&self) -> &FiberPool {
        self.fibers.get().expect("fiber pool initialized by run")
    }

    fn worker(&self, index: usize) -> &WorkerShared {
        &self.workers.get().expect("scheduler not running")[index]
    }

    fn sleep_behavior(&self) -> bool {
        self.behavior.get() == Some(&EmptyQueueBehavior::Sleep)
    }

    /// Wakes every sleeping worker. No-op outside the Sleep behavior.
    pub(crate) fn wake_all(&self) {
        if !self.sleep_behavior() {
            return;
        }
        if let Some(workers) = self.workers.get() {
            for worker in workers {
                worker.signal.notify();
            }
        }
    }

    /// Publishes a fiber as runnable again, either to the global resumable
    /// queue or to the pinned queue of a specific worker.
    pub(crate) fn make_resumable(&self, fiber: Box<Fiber>, pin_to: Option<usize>) {
        match pin_to {
            Some(index) => {
                let worker = self.worker(index);
                worker.pinned.push(fiber);
                if self.sleep_behavior() {
                    worker.signal.notify();
                }
            }
            None => {
                self.resumable.push(fiber);
                self.wake_all();
            }
        }
    }

    fn drained(&self, index: usize, local: &Deque<QueuedTask>) -> bool {
        local.is_empty()
            && self.injector.is_empty()
            && self.resumable.is_empty()
            && self.worker(index).pinned.is_empty()
    }
}

/// A fiber-based task scheduler.
///
/// Construct one, optionally create [`AtomicCounter`]s and
/// [`Fibtex`](crate::Fibtex)es against it, then call [`run`](Self::run)
/// with the main task. `run` returns once the main task has completed and
/// the workers have drained.
///
/// # Example
///
/// ```no_run
/// use weft::{AtomicCounter, EmptyQueueBehavior, Task, TaskScheduler};
///
/// let scheduler = TaskScheduler::new();
/// scheduler
///     .run(64, 4, EmptyQueueBehavior::Yield, |ts| {
///         let counter = AtomicCounter::new(ts);
///         for i in 0..32 {
///             ts.add_task(Task::new(move |_| println!("task {i}")), Some(&counter));
///         }
///         ts.wait_for_counter(&counter, 0);
///     })
///     .unwrap();
/// ```
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        TaskScheduler {
            shared: Arc::new(Shared::new()),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        TaskScheduler { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Starts the scheduler and blocks until the main task completes.
    ///
    /// Allocates `fiber_pool_size` fibers, spawns `thread_count - 1`
    /// workers (the calling thread becomes worker 0), enqueues `main_task`
    /// and runs until the main task returns and all queues drain.
    ///
    /// May only be called once per scheduler.
    pub fn run<F>(
        &self,
        fiber_pool_size: usize,
        thread_count: usize,
        behavior: EmptyQueueBehavior,
        main_task: F,
    ) -> Result<(), SchedulerError>
    where
        F: FnOnce(&TaskScheduler) + Send + 'static,
    {
        if thread_count == 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "thread_count must be non-zero",
            ));
        }
        if fiber_pool_size == 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "fiber_pool_size must be non-zero",
            ));
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRan);
        }

        tracing::debug!(
            fibers = fiber_pool_size,
            workers = thread_count,
            ?behavior,
            "scheduler starting"
        );

        let pool = FiberPool::new(
            fiber_pool_size,
            FIBER_STACK_SIZE,
            Arc::downgrade(&self.shared),
        )?;
        let _ = self.shared.fibers.set(pool);
        let _ = self.shared.behavior.set(behavior);

        let mut locals: Vec<Deque<QueuedTask>> = Vec::with_capacity(thread_count);
        let mut stealers = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            locals.push(deque);
        }
        let _ = self.shared.stealers.set(stealers);
        let _ = self
            .shared
            .workers
            .set((0..thread_count).map(|_| WorkerShared::new()).collect());

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        let local0 = locals.remove(0);
        let mut handles = Vec::with_capacity(thread_count - 1);
        let mut spawn_error = None;
        for (offset, local) in locals.into_iter().enumerate() {
            let index = offset + 1;
            let shared = Arc::clone(&self.shared);
            let core = core_ids.get(index).copied();
            match thread::Builder::new()
                .name(format!("weft-worker-{index}"))
                .spawn(move || worker_loop(index, shared, local, core))
            {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    spawn_error = Some(SchedulerError::ThreadSpawn(error));
                    break;
                }
            }
        }

        if let Some(error) = spawn_error {
            self.shared.quit.store(true, Ordering::SeqCst);
            self.shared.wake_all();
            for handle in handles {
                let _ = handle.join();
            }
            return Err(error);
        }

        // The main task flips the quit flag on return; workers exit once
        // they see the flag with empty queues.
        let shared = Arc::clone(&self.shared);
        self.add_task(
            Task::new(move |ts| {
                main_task(ts);
                shared.quit.store(true, Ordering::SeqCst);
                shared.wake_all();
            }),
            None,
        );

        worker_loop(0, Arc::clone(&self.shared), local0, None);
        WORKER_INDEX.set(None);

        let mut result = Ok(());
        for (offset, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                result = Err(SchedulerError::WorkerPanicked { index: offset + 1 });
            }
        }
        tracing::debug!("scheduler stopped");
        result
    }

    /// Enqueues a task, incrementing `counter` if one is given. The counter
    /// is decremented when the task completes.
    pub fn add_task(&self, task: Task, counter: Option<&AtomicCounter>) {
        let counter_state = counter.map(|counter| {
            let state = Arc::clone(counter.state());
            state.add(1);
            state
        });
        self.shared.injector.push(QueuedTask {
            task,
            counter: counter_state,
        });
        self.shared.wake_all();
    }

    /// Enqueues a batch of tasks, adding the batch size to `counter` up
    /// front so a waiter cannot observe a partially-counted batch.
    pub fn add_tasks(&self, tasks: Vec<Task>, counter: Option<&AtomicCounter>) {
        if let Some(counter) = counter {
            counter.state().add(tasks.len());
        }
        for task in tasks {
            let counter_state = counter.map(|counter| Arc::clone(counter.state()));
            self.shared.injector.push(QueuedTask {
                task,
                counter: counter_state,
            });
        }
        self.shared.wake_all();
    }

    /// Suspends the calling fiber until `counter` equals `target`.
    ///
    /// Returns immediately when the value already matches. Must be called
    /// from task code; the worker is freed to run other fibers meanwhile.
    pub fn wait_for_counter(&self, counter: &AtomicCounter, target: usize) {
        self.wait_for(counter, target, false);
    }

    /// Like [`wait_for_counter`](Self::wait_for_counter), but resumption
    /// happens on the worker that parked the fiber. For code that must
    /// come back to thread-local state such as a graphics command list.
    pub fn wait_for_counter_pinned(&self, counter: &AtomicCounter, target: usize) {
        self.wait_for(counter, target, true);
    }

    fn wait_for(&self, counter: &AtomicCounter, target: usize, pinned: bool) {
        if counter.load() == target {
            return;
        }
        fiber::park(FiberYield::WaitCounter {
            counter: Arc::clone(counter.state()),
            target,
            pinned,
        });
    }

    /// Index of the worker executing the calling thread, or `None` off the
    /// worker pool.
    pub fn current_thread_index(&self) -> Option<usize> {
        WORKER_INDEX.get()
    }

    /// Snapshot of the scheduler's event counters.
    #[cfg(feature = "metrics")]
    pub fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        TaskScheduler::new()
    }
}

fn worker_loop(
    index: usize,
    shared: Arc<Shared>,
    local: Deque<QueuedTask>,
    core: Option<CoreId>,
) {
    WORKER_INDEX.set(Some(index));
    if let Some(core) = core {
        core_affinity::set_for_current(core);
    }
    let behavior = *shared
        .behavior
        .get()
        .expect("behavior installed before workers start");
    tracing::trace!(worker = index, "worker online");

    loop {
        if let Some(fiber) = next_resumable(&shared, index) {
            run_fiber(&shared, index, fiber, FiberInput::Resume);
            continue;
        }

        if let Some(task) = next_task(&shared, &local) {
            match shared.fiber_pool().acquire() {
                Some(fiber) => {
                    run_fiber(&shared, index, fiber, FiberInput::Run(task));
                }
                None => {
                    // Pool exhausted: requeue the task and loop so that
                    // resumable fibers can finish and free their slots.
                    shared.injector.push(task);
                }
            }
            continue;
        }

        if shared.quit.load(Ordering::SeqCst) && shared.drained(index, &local) {
            break;
        }

        match behavior {
            EmptyQueueBehavior::Spin => hint::spin_loop(),
            EmptyQueueBehavior::Yield => thread::yield_now(),
            EmptyQueueBehavior::Sleep => shared.worker(index).signal.wait(),
        }
    }

    tracing::trace!(worker = index, "worker offline");
}

fn next_resumable(shared: &Shared, index: usize) -> Option<Box<Fiber>> {
    if let Some(fiber) = shared.worker(index).pinned.pop() {
        #[cfg(feature = "metrics")]
        shared.metrics.pinned_resumes.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        shared.metrics.fibers_resumed.fetch_add(1, Ordering::Relaxed);
        return Some(fiber);
    }
    loop {
        match shared.resumable.steal() {
            Steal::Success(fiber) => {
                #[cfg(feature = "metrics")]
                shared.metrics.fibers_resumed.fetch_add(1, Ordering::Relaxed);
                return Some(fiber);
            }
            Steal::Empty => return None,
            Steal::Retry => {}
        }
    }
}

fn next_task(shared: &Shared, local: &Deque<QueuedTask>) -> Option<QueuedTask> {
    if let Some(task) = local.pop() {
        return Some(task);
    }

    let mut retries = 0;
    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Empty => break,
            Steal::Retry => {
                #[cfg(feature = "metrics")]
                shared.metrics.steal_retries.fetch_add(1, Ordering::Relaxed);
                retries += 1;
                if retries >= MAX_STEAL_RETRIES {
                    break;
                }
            }
        }
    }

    shared
        .stealers
        .get()
        .expect("stealers installed before workers start")
        .iter()
        .find_map(|stealer| match stealer.steal() {
            Steal::Success(task) => Some(task),
            _ => None,
        })
}

/// Resumes a fiber and completes its disposition once it suspends.
///
/// This is the second phase of the switch protocol: the fiber's stack has
/// quiesced by the time any of the arms below run, so publishing it to a
/// waiter list or queue cannot race with its own execution.
fn run_fiber(shared: &Arc<Shared>, index: usize, mut fiber: Box<Fiber>, input: FiberInput) {
    match fiber.resume(input) {
        FiberStep::Yielded(FiberYield::TaskDone) => {
            #[cfg(feature = "metrics")]
            shared.metrics.tasks_executed.fetch_add(1, Ordering::Relaxed);
            shared.fiber_pool().release(fiber);
        }
        FiberStep::Yielded(FiberYield::WaitCounter {
            counter,
            target,
            pinned,
        }) => {
            #[cfg(feature = "metrics")]
            shared.metrics.fibers_parked.fetch_add(1, Ordering::Relaxed);
            counter.park_fiber(fiber, target, pinned, index);
        }
        FiberStep::Yielded(FiberYield::WaitLock { lock }) => {
            #[cfg(feature = "metrics")]
            shared.metrics.lock_parks.fetch_add(1, Ordering::Relaxed);
            lock.park_fiber(fiber);
        }
        FiberStep::Crashed(payload) => {
            tracing::error!(
                worker = index,
                fiber = fiber.id(),
                "task panicked: {}",
                panic_message(payload.as_ref())
            );
            let id = fiber.id();
            let stack_size = shared.fiber_pool().stack_size();
            drop(fiber);
            match Fiber::new(id, stack_size, Arc::downgrade(shared)) {
                Ok(replacement) => shared.fiber_pool().release(Box::new(replacement)),
                Err(error) => tracing::error!(
                    %error,
                    "could not replace the panicked fiber; the pool shrinks"
                ),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn zero_threads_rejected() {
        let scheduler = TaskScheduler::new();
        let result = scheduler.run(16, 0, EmptyQueueBehavior::Spin, |_| {});
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn zero_fibers_rejected() {
        let scheduler = TaskScheduler::new();
        let result = scheduler.run(0, 2, EmptyQueueBehavior::Spin, |_| {});
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn run_is_single_shot() {
        let scheduler = TaskScheduler::new();
        scheduler
            .run(8, 2, EmptyQueueBehavior::Yield, |_| {})
            .unwrap();
        let again = scheduler.run(8, 2, EmptyQueueBehavior::Yield, |_| {});
        assert!(matches!(again, Err(SchedulerError::AlreadyRan)));
    }

    #[test]
    fn main_task_runs_and_can_spawn() {
        let scheduler = TaskScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        scheduler
            .run(32, 4, EmptyQueueBehavior::Yield, move |ts| {
                let counter = AtomicCounter::new(ts);
                for _ in 0..100 {
                    let hits = Arc::clone(&hits_clone);
                    ts.add_task(
                        Task::new(move |_| {
                            hits.fetch_add(1, Ordering::SeqCst);
                        }),
                        Some(&counter),
                    );
                }
                ts.wait_for_counter(&counter, 0);
                assert_eq!(hits_clone.load(Ordering::SeqCst), 100);
            })
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn thread_index_visible_inside_tasks() {
        let scheduler = TaskScheduler::new();
        let thread_count = 3;

        scheduler
            .run(16, thread_count, EmptyQueueBehavior::Yield, move |ts| {
                let index = ts.current_thread_index().expect("task runs on a worker");
                assert!(index < thread_count);
            })
            .unwrap();
    }

    #[test]
    fn wait_on_satisfied_counter_returns_immediately() {
        let scheduler = TaskScheduler::new();
        scheduler
            .run(8, 1, EmptyQueueBehavior::Spin, |ts| {
                let counter = AtomicCounter::new(ts);
                // Already at target; must not park.
                ts.wait_for_counter(&counter, 0);
            })
            .unwrap();
    }
}
