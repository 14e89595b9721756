// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation for device invocations.
//!
//! The token counts cancel requests instead of latching a flag. A poller
//! takes a snapshot when it starts and only reacts to requests made after
//! that point, so one interrupt kills the handles that were in flight and
//! leaves later invocations alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cancellation token shared between a signal source and its pollers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    requests: Arc<AtomicU64>,
}

/// Point in a token's history captured by [`CancelToken::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelSnapshot(u64);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cancel request. Lock-free, safe to call from a signal handler.
    pub fn cancel(&self) {
        self.requests.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether any request was ever made.
    pub fn is_cancelled(&self) -> bool {
        self.requests.load(Ordering::Acquire) > 0
    }

    pub fn snapshot(&self) -> CancelSnapshot {
        CancelSnapshot(self.requests.load(Ordering::Acquire))
    }

    /// Whether a request arrived after `since` was taken.
    pub fn cancelled_since(&self, since: CancelSnapshot) -> bool {
        self.requests.load(Ordering::Acquire) != since.0
    }
}
