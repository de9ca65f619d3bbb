//! # weft: fiber-based task scheduling
//!
//! A bounded pool of worker threads each running a cooperative scheduler of
//! user-space stacks (fibers), in the style popularized by Christian
//! Gyrling's 2015 GDC talk on parallelizing a game engine with fibers.
//! Tasks are fine-grained units of work synchronized through atomic
//! counters; waiting suspends the *fiber*, never the worker thread
//! underneath it.
//!
//! ## Components
//!
//! - [`TaskScheduler`]: worker threads, ready queues and the fiber-switch
//!   protocol. [`TaskScheduler::run`] blocks until the main task finishes.
//! - [`AtomicCounter`]: completion tracking and the wait primitive —
//!   [`TaskScheduler::wait_for_counter`] parks the calling fiber until the
//!   counter reaches a target value.
//! - [`Fibtex`]: a mutex owned by fibers rather than threads, with
//!   blocking, bounded-spin and pure-spin acquisition plus the usual guard
//!   family.
//!
//! ## Example
//!
//! ```no_run
//! use weft::{AtomicCounter, EmptyQueueBehavior, Task, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new();
//! scheduler
//!     .run(128, 4, EmptyQueueBehavior::Yield, |ts| {
//!         let counter = AtomicCounter::new(ts);
//!         for chunk in 0..16 {
//!             ts.add_task(
//!                 Task::new(move |_| {
//!                     // work on `chunk`
//!                     let _ = chunk;
//!                 }),
//!                 Some(&counter),
//!             );
//!         }
//!         ts.wait_for_counter(&counter, 0);
//!     })
//!     .unwrap();
//! ```

pub mod counter;
pub mod error;
mod fiber;
mod fiber_pool;
pub mod fibtex;
pub mod metrics;
pub mod scheduler;
pub mod task;

pub use counter::AtomicCounter;
pub use error::SchedulerError;
pub use fibtex::{
    Fibtex, InfiniteSpinLockGuard, LockGuard, ScopedLock, SpinLockGuard, UniqueLock,
};
pub use scheduler::{EmptyQueueBehavior, TaskScheduler};
pub use task::Task;
