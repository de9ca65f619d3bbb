//! Task definitions and completion plumbing.

use std::sync::Arc;

use crate::counter::CounterState;
use crate::scheduler::{Shared, TaskScheduler};

/// A unit of work submitted to the scheduler.
///
/// The body receives the scheduler so it can submit further tasks and wait
/// on counters. Everything else the task needs is captured by the closure.
pub struct Task {
    body: Box<dyn FnOnce(&TaskScheduler) + Send + 'static>,
}

impl Task {
    /// Wraps a closure as a schedulable task.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&TaskScheduler) + Send + 'static,
    {
        Task {
            body: Box::new(body),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// A task coupled with the counter it decrements on completion.
pub(crate) struct QueuedTask {
    pub(crate) task: Task,
    pub(crate) counter: Option<Arc<CounterState>>,
}

impl QueuedTask {
    /// Runs the task body on the current fiber.
    ///
    /// The completion decrement is performed by a drop guard so it also
    /// fires when the body panics and the fiber stack unwinds.
    pub(crate) fn run(self, shared: &Arc<Shared>) {
        let _completion = CompletionGuard {
            counter: self.counter,
        };
        let scheduler = TaskScheduler::from_shared(Arc::clone(shared));
        (self.task.body)(&scheduler);
    }
}

struct CompletionGuard {
    counter: Option<Arc<CounterState>>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(counter) = self.counter.take() {
            counter.sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn queued_task_runs_body_and_decrements() {
        let scheduler = TaskScheduler::new();
        let counter = crate::AtomicCounter::with_value(&scheduler, 1);
        let ran = Arc::new(AtomicBool::new(false));

        let ran_clone = ran.clone();
        let queued = QueuedTask {
            task: Task::new(move |_| {
                ran_clone.store(true, Ordering::SeqCst);
            }),
            counter: Some(Arc::clone(counter.state())),
        };

        queued.run(scheduler.shared());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(counter.load(), 0);
    }
}
