// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread-backed execution (compatibility mode).
//!
//! Every invocation gets its own OS thread driving the body with
//! [`block_on`], so each suspension degrades to an OS-thread yield. Joined
//! threads are collected and joined by `wait()`; detached threads are let go.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::green::block_on;
use crate::green::pool::Poison;
use crate::green::task::{panic_message, Submission};

pub(crate) struct ThreadSet {
    joined: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
    poison: Arc<Poison>,
}

impl ThreadSet {
    pub fn new(poison: Arc<Poison>) -> Self {
        Self {
            joined: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
            poison,
        }
    }

    pub fn spawn(&self, sub: Submission) {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let label = sub.name.clone().unwrap_or_else(|| format!("tapa-task-{}", n));
        let poison = self.poison.clone();
        let body = sub.body;

        let handle = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| block_on(body))) {
                    let msg = panic_message(payload.as_ref());
                    tracing::error!(task = %label, "task body panicked: {}", msg);
                    poison.set(msg);
                }
            })
            .expect("failed to spawn task thread");

        if !sub.detached {
            self.joined.lock().unwrap().push(handle);
        }
    }

    /// Join every joined thread, including ones spawned while waiting.
    pub fn wait(&self) {
        loop {
            if self.poison.is_poisoned() {
                return;
            }
            let next = self.joined.lock().unwrap().pop();
            let Some(handle) = next else {
                return;
            };
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}
