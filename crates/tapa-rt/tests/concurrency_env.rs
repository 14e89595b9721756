// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! `TAPA_CONCURRENCY` sizes the pool of the outermost task. Kept in its own
//! test binary since it mutates the process environment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tapa_rt::config::CONCURRENCY_ENV;
use tapa_rt::{yield_now, Mode, Task};

#[test]
fn concurrency_hint_sets_pool_width() {
    std::env::set_var(CONCURRENCY_ENV, "1");

    let done = Arc::new(AtomicUsize::new(0));
    {
        let task = Task::new();
        assert_eq!(task.context().worker_count(), 1);
        for _ in 0..8 {
            let done = done.clone();
            task.invoke(Mode::Join, async move {
                yield_now().await;
                done.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
    assert_eq!(done.load(Ordering::Relaxed), 8);

    // An explicit width still wins over the environment.
    let task = Task::builder().workers(3).build();
    assert_eq!(task.context().worker_count(), 3);
    drop(task);

    // Garbage is ignored in favour of host detection.
    std::env::set_var(CONCURRENCY_ENV, "lots");
    let task = Task::new();
    assert!(task.context().worker_count() >= 1);
    drop(task);

    std::env::remove_var(CONCURRENCY_ENV);
}
