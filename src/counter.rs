//! The wait-counter primitive.
//!
//! Counters serve double duty: task-completion tracking (every `add_task`
//! increments, every completion decrements) and fiber suspension (a fiber
//! parks itself until the counter reaches a target value). They are the
//! only synchronization point between sibling tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::fiber::Fiber;
use crate::scheduler::{Shared, TaskScheduler};

/// A fiber parked on a counter.
struct Waiter {
    fiber: Box<Fiber>,
    target: usize,
    pinned: bool,
    thread_hint: usize,
}

/// Shared state behind an [`AtomicCounter`] handle.
pub(crate) struct CounterState {
    value: AtomicUsize,
    /// FIFO so that multiple waiters on the same target resume in
    /// registration order.
    waiters: Mutex<Vec<Waiter>>,
    /// Mirrors `waiters.len()`; lets mutations skip the lock when nobody
    /// is parked. SeqCst pairs with the value re-check in `park_fiber`.
    waiter_count: AtomicUsize,
    shared: Arc<Shared>,
}

impl CounterState {
    pub(crate) fn get(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, value: usize) {
        self.value.store(value, Ordering::SeqCst);
        self.wake_matching(value);
    }

    pub(crate) fn add(&self, n: usize) -> usize {
        let value = self.value.fetch_add(n, Ordering::SeqCst) + n;
        self.wake_matching(value);
        value
    }

    pub(crate) fn sub(&self, n: usize) -> usize {
        let previous = self.value.fetch_sub(n, Ordering::SeqCst);
        debug_assert!(previous >= n, "counter underflow");
        let value = previous.wrapping_sub(n);
        self.wake_matching(value);
        value
    }

    /// Completes a `WaitCounter` disposition: runs on the worker after the
    /// waiting fiber's stack has quiesced.
    ///
    /// The value is re-checked under the waiter lock because the counter
    /// may have reached the target while the fiber was mid-switch; in that
    /// case the fiber is immediately resumable.
    pub(crate) fn park_fiber(
        &self,
        fiber: Box<Fiber>,
        target: usize,
        pinned: bool,
        thread_hint: usize,
    ) {
        let mut waiters = self.waiters.lock().unwrap();
        waiters.push(Waiter {
            fiber,
            target,
            pinned,
            thread_hint,
        });
        self.waiter_count.store(waiters.len(), Ordering::SeqCst);

        if self.value.load(Ordering::SeqCst) == target {
            // Any earlier waiter on this target was already drained by the
            // mutation that produced it, so only the fiber just pushed can
            // match.
            let waiter = waiters.pop().expect("waiter pushed above");
            self.waiter_count.store(waiters.len(), Ordering::SeqCst);
            drop(waiters);
            self.resume(waiter);
        }
    }

    /// Moves every waiter whose target equals `value` to a resumable
    /// queue, in registration order.
    fn wake_matching(&self, value: usize) {
        if self.waiter_count.load(Ordering::SeqCst) == 0 {
            return;
        }

        let mut waiters = self.waiters.lock().unwrap();
        let mut index = 0;
        while index < waiters.len() {
            if waiters[index].target == value {
                let waiter = waiters.remove(index);
                self.waiter_count.store(waiters.len(), Ordering::SeqCst);
                self.resume(waiter);
            } else {
                index += 1;
            }
        }
    }

    fn resume(&self, waiter: Waiter) {
        let pin_to = waiter.pinned.then_some(waiter.thread_hint);
        self.shared.make_resumable(waiter.fiber, pin_to);
    }
}

/// An atomic counter bound to a scheduler.
///
/// The handle is cheaply cloneable; clones observe the same value and the
/// same waiter list. Every mutation wakes fibers whose wait target equals
/// the resulting value, so arbitrary targets work, not just zero.
#[derive(Clone)]
pub struct AtomicCounter {
    state: Arc<CounterState>,
}

impl AtomicCounter {
    /// Creates a counter starting at zero.
    pub fn new(scheduler: &TaskScheduler) -> Self {
        Self::with_value(scheduler, 0)
    }

    /// Creates a counter starting at `value`.
    pub fn with_value(scheduler: &TaskScheduler, value: usize) -> Self {
        AtomicCounter {
            state: Arc::new(CounterState {
                value: AtomicUsize::new(value),
                waiters: Mutex::new(Vec::new()),
                waiter_count: AtomicUsize::new(0),
                shared: Arc::clone(scheduler.shared()),
            }),
        }
    }

    /// Current value.
    pub fn load(&self) -> usize {
        self.state.get()
    }

    /// Overwrites the value, waking any waiter whose target it satisfies.
    pub fn store(&self, value: usize) {
        self.state.set(value);
    }

    /// Adds `n`, waking matched waiters. Returns the previous value.
    pub fn fetch_add(&self, n: usize) -> usize {
        self.state.add(n).wrapping_sub(n)
    }

    /// Subtracts `n`, waking matched waiters. Returns the previous value.
    pub fn fetch_sub(&self, n: usize) -> usize {
        self.state.sub(n).wrapping_add(n)
    }

    pub(crate) fn state(&self) -> &Arc<CounterState> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_without_waiters() {
        let scheduler = TaskScheduler::new();
        let counter = AtomicCounter::new(&scheduler);
        assert_eq!(counter.load(), 0);

        assert_eq!(counter.fetch_add(5), 0);
        assert_eq!(counter.load(), 5);

        assert_eq!(counter.fetch_sub(2), 5);
        assert_eq!(counter.load(), 3);

        counter.store(7);
        assert_eq!(counter.load(), 7);
    }

    #[test]
    fn clones_share_state() {
        let scheduler = TaskScheduler::new();
        let counter = AtomicCounter::with_value(&scheduler, 1);
        let clone = counter.clone();

        clone.fetch_add(1);
        assert_eq!(counter.load(), 2);
    }
}
