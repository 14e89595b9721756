// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fixed-size worker pool.
//!
//! Submissions are dealt to workers round robin at submission time and never
//! move afterwards: no stealing, no rebalancing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::task::Submission;
use super::worker::Worker;

/// First panic raised by any task body of one runtime.
#[derive(Debug, Default)]
pub(crate) struct Poison {
    poisoned: AtomicBool,
    message: Mutex<Option<String>>,
}

impl Poison {
    /// Record a panic. Only the first message is kept.
    pub fn set(&self, msg: String) {
        let mut slot = self.message.lock().unwrap();
        if slot.is_none() {
            *slot = Some(msg);
        }
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn take(&self) -> Option<String> {
        self.message.lock().unwrap().take()
    }
}

pub struct WorkerPool {
    workers: Vec<Worker>,
    cursor: Mutex<usize>,
    outstanding: Arc<AtomicUsize>,
    poison: Arc<Poison>,
}

impl WorkerPool {
    pub(crate) fn new(width: usize, poison: Arc<Poison>) -> Self {
        let width = width.max(1);
        let outstanding = Arc::new(AtomicUsize::new(0));
        let workers = (0..width)
            .map(|id| Worker::spawn(id, poison.clone(), outstanding.clone()))
            .collect();
        tracing::debug!(width, "worker pool started");
        Self {
            workers,
            cursor: Mutex::new(0),
            outstanding,
            poison,
        }
    }

    pub fn width(&self) -> usize {
        self.workers.len()
    }

    /// Hand a body to the next worker in round-robin order.
    pub(crate) fn add_task(&self, sub: Submission) -> usize {
        let mut cursor = self.cursor.lock().unwrap();
        let worker = &self.workers[*cursor];
        *cursor = (*cursor + 1) % self.workers.len();
        worker.submit(sub);
        worker.id()
    }

    /// Block until every worker reports no joined work left.
    ///
    /// A joined task may hand a joined child to a worker this sweep has
    /// already passed, so sweeps repeat until the pool-wide count drains.
    pub fn wait(&self) {
        loop {
            for worker in &self.workers {
                worker.wait();
            }
            if self.outstanding.load(Ordering::Acquire) == 0 || self.poison.is_poisoned() {
                return;
            }
        }
    }

    pub fn request_debug(&self) {
        for worker in &self.workers {
            worker.request_debug();
        }
    }

    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
