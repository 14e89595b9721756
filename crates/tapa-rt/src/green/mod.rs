// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative task runtime.
//!
//! A fixed set of OS threads, each multiplexing many task continuations.
//! Continuations are stackless futures; the only suspension point is
//! [`yield_now`].
//!
//! Components:
//! - `task`: continuations, submissions, result slots
//! - `worker`: one thread, round-robin over its live continuations
//! - `pool`: fixed set of workers, round-robin assignment, `wait()`
//! - `yield_now`: suspension point and `block_on`

pub mod pool;
pub(crate) mod task;
pub(crate) mod worker;
pub mod yield_now;

pub use pool::WorkerPool;
pub use yield_now::{block_on, yield_now};
