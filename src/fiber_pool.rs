//! The free fiber pool.

use std::sync::Weak;

use crossbeam::queue::ArrayQueue;

use crate::error::SchedulerError;
use crate::fiber::Fiber;
use crate::scheduler::Shared;

/// Pre-allocated fibers not currently running or waiting.
///
/// Acquisition is a single lock-free pop. The pool is sized once at startup
/// and every fiber that leaves it eventually comes back, so pushes cannot
/// overflow.
pub(crate) struct FiberPool {
    fibers: ArrayQueue<Box<Fiber>>,
    stack_size: usize,
}

impl FiberPool {
    pub(crate) fn new(
        count: usize,
        stack_size: usize,
        shared: Weak<Shared>,
    ) -> Result<Self, SchedulerError> {
        let fibers = ArrayQueue::new(count);
        for id in 0..count {
            let fiber = Fiber::new(id, stack_size, shared.clone())
                .map_err(SchedulerError::StackAllocation)?;
            if fibers.push(Box::new(fiber)).is_err() {
                unreachable!("pool sized to hold every fiber");
            }
        }
        Ok(FiberPool { fibers, stack_size })
    }

    pub(crate) fn acquire(&self) -> Option<Box<Fiber>> {
        self.fibers.pop()
    }

    pub(crate) fn release(&self, fiber: Box<Fiber>) {
        if self.fibers.push(fiber).is_err() {
            unreachable!("pool sized to hold every fiber");
        }
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }
}
