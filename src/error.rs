//! Errors surfaced by scheduler startup.
//!
//! Everything past a successful `run` is infallible by design: task
//! submission, counter waits and Fibtex operations never return errors.

use std::io;

use thiserror::Error;

/// Errors returned by [`TaskScheduler::run`](crate::TaskScheduler::run).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A startup parameter was rejected before any resource was allocated.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    /// `run` was called on a scheduler that has already run.
    #[error("the scheduler has already run")]
    AlreadyRan,

    /// A fiber stack could not be allocated.
    #[error("failed to allocate a fiber stack")]
    StackAllocation(#[source] io::Error),

    /// A worker thread could not be spawned.
    #[error("failed to spawn a worker thread")]
    ThreadSpawn(#[source] io::Error),

    /// A worker thread died with an unrecovered panic.
    #[error("worker thread {index} panicked")]
    WorkerPanicked { index: usize },
}
