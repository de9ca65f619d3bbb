//! Pinned waits resume on the worker that parked them, even when the
//! counter is satisfied from a different worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use weft::{AtomicCounter, EmptyQueueBehavior, Task, TaskScheduler};

const WAITERS: usize = 8;

#[test]
fn pinned_waiters_resume_where_parked() {
    let scheduler = TaskScheduler::new();
    let resumed_in_place = Arc::new(AtomicUsize::new(0));

    let resumed_clone = Arc::clone(&resumed_in_place);
    scheduler
        .run(64, 4, EmptyQueueBehavior::Yield, move |ts| {
            let release = AtomicCounter::new(ts);
            let done = AtomicCounter::new(ts);

            for _ in 0..WAITERS {
                let release = release.clone();
                let resumed = Arc::clone(&resumed_clone);
                ts.add_task(
                    Task::new(move |ts| {
                        let parked_on = ts.current_thread_index().expect("on a worker");
                        ts.wait_for_counter_pinned(&release, 1);
                        let resumed_on = ts.current_thread_index().expect("on a worker");

                        assert_eq!(
                            parked_on, resumed_on,
                            "pinned fiber resumed on the wrong worker"
                        );
                        resumed.fetch_add(1, Ordering::SeqCst);
                    }),
                    Some(&done),
                );
            }

            // Give the waiters time to actually park before satisfying the
            // counter from this worker.
            thread::sleep(Duration::from_millis(50));
            release.fetch_add(1);

            ts.wait_for_counter(&done, 0);
        })
        .unwrap();

    assert_eq!(resumed_in_place.load(Ordering::SeqCst), WAITERS);
}
