//! Fiber wrapper over a stackful coroutine.
//!
//! A fiber suspends by yielding a *disposition* describing what should
//! happen to it. The worker that performed the switch completes the
//! disposition on its own stack, after the fiber's stack has quiesced, so a
//! suspending fiber is never visible to another worker while its context is
//! still in flux.

use std::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Weak};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::counter::CounterState;
use crate::fibtex::FibtexState;
use crate::scheduler::Shared;
use crate::task::QueuedTask;

/// What a worker feeds into a fiber when resuming it.
pub(crate) enum FiberInput {
    /// Run a fresh task on an idle fiber.
    Run(QueuedTask),
    /// Continue a fiber that was parked on a counter or a Fibtex.
    Resume,
}

/// The disposition a fiber hands to its worker when it suspends.
pub(crate) enum FiberYield {
    /// The task finished; the fiber goes back to the free pool.
    TaskDone,
    /// Attach the fiber to `counter`'s waiter list.
    WaitCounter {
        counter: Arc<CounterState>,
        target: usize,
        pinned: bool,
    },
    /// Attach the fiber to `lock`'s waiter list, or hand it the lock if it
    /// was released during the switch.
    WaitLock { lock: Arc<FibtexState> },
}

type FiberYielder = Yielder<FiberInput, FiberYield>;

/// Outcome of resuming a fiber, as seen by the worker.
pub(crate) enum FiberStep {
    Yielded(FiberYield),
    /// The fiber's task panicked and the fiber stack has unwound. The
    /// coroutine is spent and the fiber must be replaced in the pool.
    Crashed(Box<dyn std::any::Any + Send>),
}

/// Identity of the fiber currently executing on this thread.
#[derive(Clone, Copy)]
pub(crate) struct FiberRef {
    pub(crate) id: usize,
    yielder: *const Cell<*const FiberYielder>,
}

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberRef>> = const { Cell::new(None) };
}

/// The fiber executing on the calling thread, if any.
pub(crate) fn current_fiber() -> Option<FiberRef> {
    CURRENT_FIBER.get()
}

/// Suspends the current fiber with the given disposition.
///
/// Returns once another worker (or the same one) resumes the fiber.
/// Panics when called outside a scheduler fiber: waits may only be issued
/// from task code.
pub(crate) fn park(disposition: FiberYield) {
    let fiber = CURRENT_FIBER
        .get()
        .expect("fiber wait issued outside a scheduler task");
    // SAFETY: the slot outlives the fiber and the yielder stays valid for
    // the whole life of the coroutine.
    let yielder = unsafe {
        let slot = &*fiber.yielder;
        debug_assert!(!slot.get().is_null());
        &*slot.get()
    };
    match yielder.suspend(disposition) {
        FiberInput::Resume => {}
        FiberInput::Run(_) => unreachable!("parked fiber handed a fresh task"),
    }
}

/// A pooled user-space execution context with its own fixed stack.
///
/// The coroutine body is an endless serve loop: receive a task, run it,
/// yield `TaskDone`, wait for the next task. Fibers are created once at
/// startup and only replaced if a task panic burns one down.
pub(crate) struct Fiber {
    id: usize,
    /// Written once by the coroutine body on first entry; kept on the heap
    /// so the running fiber can reach its own yielder through
    /// [`current_fiber`] without aliasing the `Fiber` struct.
    yielder: Box<Cell<*const FiberYielder>>,
    coroutine: Coroutine<FiberInput, FiberYield, ()>,
}

// Fibers migrate between workers through the free pool, waiter lists and
// resumable queues. Everything captured on a suspended fiber's stack comes
// from `Send` task closures.
unsafe impl Send for Fiber {}

struct SlotPtr(*const Cell<*const FiberYielder>);
unsafe impl Send for SlotPtr {}

impl Fiber {
    pub(crate) fn new(id: usize, stack_size: usize, shared: Weak<Shared>) -> io::Result<Self> {
        let yielder: Box<Cell<*const FiberYielder>> = Box::new(Cell::new(ptr::null()));
        let slot = SlotPtr(yielder.as_ref() as *const _);
        let stack = DefaultStack::new(stack_size)?;

        let coroutine = Coroutine::with_stack(stack, move |yielder, mut input: FiberInput| {
            // SAFETY: the slot is owned by the Fiber that owns this
            // coroutine and is freed only after the coroutine is dropped.
            unsafe { (*slot.0).set(yielder as *const _) };
            loop {
                match input {
                    FiberInput::Run(task) => {
                        let shared = shared
                            .upgrade()
                            .expect("scheduler state dropped while a fiber was running");
                        task.run(&shared);
                        drop(shared);
                        input = yielder.suspend(FiberYield::TaskDone);
                    }
                    FiberInput::Resume => unreachable!("idle fiber resumed without a task"),
                }
            }
        });

        Ok(Fiber {
            id,
            yielder,
            coroutine,
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Switches onto the fiber and runs it until its next suspension.
    pub(crate) fn resume(&mut self, input: FiberInput) -> FiberStep {
        CURRENT_FIBER.set(Some(FiberRef {
            id: self.id,
            yielder: self.yielder.as_ref() as *const _,
        }));
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.coroutine.resume(input)));
        CURRENT_FIBER.set(None);

        match result {
            Ok(CoroutineResult::Yield(disposition)) => FiberStep::Yielded(disposition),
            Ok(CoroutineResult::Return(())) => unreachable!("fiber serve loop returned"),
            Err(payload) => FiberStep::Crashed(payload),
        }
    }
}
