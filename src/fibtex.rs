//! Fiber-aware mutual exclusion.
//!
//! A [`Fibtex`] is owned by a *fiber*, not a thread: the thread executing
//! the owner may change across suspensions, and contention parks the
//! acquiring fiber instead of blocking the worker underneath it. Unlock
//! hands the lock directly to the head of the waiter queue.

use std::collections::VecDeque;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::fiber::{self, Fiber, FiberYield};
use crate::scheduler::{Shared, TaskScheduler};

/// Owner markers outside the fiber id space.
const UNOWNED: usize = usize::MAX;
const EXTERNAL: usize = usize::MAX - 1;

fn holder_id() -> usize {
    fiber::current_fiber().map(|f| f.id).unwrap_or(EXTERNAL)
}

/// Shared state behind a [`Fibtex`].
pub(crate) struct FibtexState {
    locked: AtomicBool,
    /// Fiber id of the owner; debug bookkeeping for misuse assertions.
    owner: AtomicUsize,
    waiters: Mutex<VecDeque<Box<Fiber>>>,
    shared: Arc<Shared>,
}

impl FibtexState {
    fn try_acquire(&self, holder: usize) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(holder, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Completes a `WaitLock` disposition on the worker's stack.
    ///
    /// The acquisition is retried under the waiter lock because the owner
    /// may have released during the switch; in that case the parked fiber
    /// becomes the owner and is immediately resumable.
    pub(crate) fn park_fiber(&self, fiber: Box<Fiber>) {
        let mut waiters = self.waiters.lock().unwrap();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(fiber.id(), Ordering::Relaxed);
            drop(waiters);
            self.shared.make_resumable(fiber, None);
        } else {
            waiters.push_back(fiber);
        }
    }

    fn release(&self) {
        debug_assert!(
            self.locked.load(Ordering::Relaxed),
            "unlock of an unlocked Fibtex"
        );
        let owner = self.owner.load(Ordering::Relaxed);
        let holder = holder_id();
        debug_assert!(
            owner == holder || owner == EXTERNAL || holder == EXTERNAL,
            "Fibtex unlocked by a non-owner fiber"
        );

        let mut waiters = self.waiters.lock().unwrap();
        if let Some(next) = waiters.pop_front() {
            // Direct handoff: `locked` stays set so nobody can slip in
            // between the release and the waiter's resumption.
            self.owner.store(next.id(), Ordering::Relaxed);
            drop(waiters);
            self.shared.make_resumable(next, None);
        } else {
            self.owner.store(UNOWNED, Ordering::Relaxed);
            self.locked.store(false, Ordering::Release);
        }
    }
}

/// A non-recursive mutex whose ownership unit is a fiber.
///
/// Three acquisition modes are offered: blocking (`lock`), bounded spin
/// with blocking fallback (`lock_spin`, budget fixed at construction), and
/// pure spin (`lock_spin_infinite`, for critical sections of a handful of
/// instructions).
pub struct Fibtex {
    state: Arc<FibtexState>,
    spin_budget: usize,
}

impl Fibtex {
    pub fn new(scheduler: &TaskScheduler, spin_budget: usize) -> Self {
        Fibtex {
            state: Arc::new(FibtexState {
                locked: AtomicBool::new(false),
                owner: AtomicUsize::new(UNOWNED),
                waiters: Mutex::new(VecDeque::new()),
                shared: Arc::clone(scheduler.shared()),
            }),
            spin_budget,
        }
    }

    /// Attempts the lock without suspending. Returns whether it was taken.
    pub fn try_lock(&self) -> bool {
        self.state.try_acquire(holder_id())
    }

    /// Acquires the lock, parking the current fiber on contention.
    ///
    /// When the parked fiber is resumed, ownership has already been handed
    /// to it by the releasing fiber.
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        fiber::park(FiberYield::WaitLock {
            lock: Arc::clone(&self.state),
        });
        debug_assert_eq!(self.state.owner.load(Ordering::Relaxed), holder_id());
    }

    /// Spins up to the construction-time budget, then falls back to
    /// blocking.
    pub fn lock_spin(&self) {
        for _ in 0..self.spin_budget {
            if self.try_lock() {
                return;
            }
            hint::spin_loop();
        }
        self.lock();
    }

    /// Spins until acquired. Never yields the worker.
    pub fn lock_spin_infinite(&self) {
        while !self.try_lock() {
            hint::spin_loop();
        }
    }

    /// Releases the lock, handing it to the head waiter if one is parked.
    pub fn unlock(&self) {
        self.state.release();
    }

    pub(crate) fn state_ptr(&self) -> usize {
        Arc::as_ptr(&self.state) as usize
    }
}

/// RAII guard over [`Fibtex::lock`].
pub struct LockGuard<'a> {
    lock: &'a Fibtex,
}

impl<'a> LockGuard<'a> {
    pub fn new(lock: &'a Fibtex) -> Self {
        lock.lock();
        LockGuard { lock }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// RAII guard over [`Fibtex::lock_spin`].
pub struct SpinLockGuard<'a> {
    lock: &'a Fibtex,
}

impl<'a> SpinLockGuard<'a> {
    pub fn new(lock: &'a Fibtex) -> Self {
        lock.lock_spin();
        SpinLockGuard { lock }
    }
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// RAII guard over [`Fibtex::lock_spin_infinite`].
pub struct InfiniteSpinLockGuard<'a> {
    lock: &'a Fibtex,
}

impl<'a> InfiniteSpinLockGuard<'a> {
    pub fn new(lock: &'a Fibtex) -> Self {
        lock.lock_spin_infinite();
        InfiniteSpinLockGuard { lock }
    }
}

impl Drop for InfiniteSpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Deferred, re-lockable ownership of a single [`Fibtex`].
///
/// Unlike the scope guards, a `UniqueLock` may be acquired and released
/// repeatedly, in any of the three modes. Still released at scope exit if
/// held.
pub struct UniqueLock<'a> {
    lock: &'a Fibtex,
    owned: bool,
}

impl<'a> UniqueLock<'a> {
    /// Acquires (blocking) at construction.
    pub fn new(lock: &'a Fibtex) -> Self {
        lock.lock();
        UniqueLock { lock, owned: true }
    }

    /// Takes the lock reference without acquiring.
    pub fn deferred(lock: &'a Fibtex) -> Self {
        UniqueLock { lock, owned: false }
    }

    pub fn lock(&mut self) {
        debug_assert!(!self.owned, "UniqueLock is not recursive");
        self.lock.lock();
        self.owned = true;
    }

    pub fn lock_spin(&mut self) {
        debug_assert!(!self.owned, "UniqueLock is not recursive");
        self.lock.lock_spin();
        self.owned = true;
    }

    pub fn lock_spin_infinite(&mut self) {
        debug_assert!(!self.owned, "UniqueLock is not recursive");
        self.lock.lock_spin_infinite();
        self.owned = true;
    }

    pub fn try_lock(&mut self) -> bool {
        debug_assert!(!self.owned, "UniqueLock is not recursive");
        self.owned = self.lock.try_lock();
        self.owned
    }

    pub fn unlock(&mut self) {
        debug_assert!(self.owned, "unlock of an unheld UniqueLock");
        self.lock.unlock();
        self.owned = false;
    }

    pub fn owns_lock(&self) -> bool {
        self.owned
    }
}

impl Drop for UniqueLock<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.lock.unlock();
        }
    }
}

/// Deadlock-free acquisition of several distinct Fibtexes at once.
///
/// The blocking constructor sorts the set by allocation address before
/// locking, so two fibers grabbing the same locks in opposite textual
/// order cannot deadlock. Release happens in reverse acquisition order at
/// scope exit.
pub struct ScopedLock<'a> {
    /// In acquisition order.
    locks: Vec<&'a Fibtex>,
}

impl<'a> ScopedLock<'a> {
    /// Acquires every lock, ordered by address. The locks must be
    /// distinct: a duplicate deadlocks on itself.
    pub fn new(locks: &[&'a Fibtex]) -> Self {
        let mut ordered = locks.to_vec();
        ordered.sort_by_key(|lock| lock.state_ptr());
        for lock in &ordered {
            lock.lock();
        }
        ScopedLock { locks: ordered }
    }

    /// Try-locks every lock in address order; on the first failure all
    /// locks taken so far are released and `None` is returned.
    pub fn try_new(locks: &[&'a Fibtex]) -> Option<Self> {
        let mut ordered = locks.to_vec();
        ordered.sort_by_key(|lock| lock.state_ptr());
        for (index, lock) in ordered.iter().enumerate() {
            if !lock.try_lock() {
                for held in ordered[..index].iter().rev() {
                    held.unlock();
                }
                return None;
            }
        }
        Some(ScopedLock { locks: ordered })
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        for lock in self.locks.iter().rev() {
            lock.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AtomicCounter, EmptyQueueBehavior, Task};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn try_lock_reflects_ownership() {
        let scheduler = TaskScheduler::new();
        let lock = Fibtex::new(&scheduler, 4);

        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn unique_lock_releases_on_drop() {
        let scheduler = TaskScheduler::new();
        let lock = Fibtex::new(&scheduler, 4);

        {
            let mut unique = UniqueLock::deferred(&lock);
            assert!(!unique.owns_lock());
            assert!(unique.try_lock());
            assert!(unique.owns_lock());
        }
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn contended_increments_stay_exclusive() {
        let scheduler = TaskScheduler::new();
        let lock = Arc::new(Fibtex::new(&scheduler, 8));
        let hits = Arc::new(AtomicUsize::new(0));

        let tasks = 8;
        let per_task = 100;

        scheduler
            .run(32, 4, EmptyQueueBehavior::Yield, {
                let lock = Arc::clone(&lock);
                let hits = Arc::clone(&hits);
                move |ts| {
                    let counter = AtomicCounter::new(ts);
                    for _ in 0..tasks {
                        let lock = Arc::clone(&lock);
                        let hits = Arc::clone(&hits);
                        ts.add_task(
                            Task::new(move |_| {
                                for _ in 0..per_task {
                                    let _guard = LockGuard::new(&lock);
                                    let value = hits.load(Ordering::Acquire);
                                    hits.store(value + 1, Ordering::Release);
                                }
                            }),
                            Some(&counter),
                        );
                    }
                    ts.wait_for_counter(&counter, 0);
                }
            })
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), tasks * per_task);
    }
}
