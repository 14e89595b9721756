// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task continuations.
//!
//! A continuation is one task-body invocation: a boxed future plus the
//! `detached` bit that decides whether it holds up a `wait()`. It lives on
//! exactly one worker from creation until its body returns.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};

/// Type-erased task body.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Work handed to a worker but not yet turned into a continuation.
pub(crate) struct Submission {
    pub detached: bool,
    pub name: Option<String>,
    pub body: BoxFuture,
}

impl Submission {
    pub fn new(detached: bool, name: Option<String>, body: BoxFuture) -> Self {
        Self {
            detached,
            name,
            body,
        }
    }
}

pub(crate) struct Continuation {
    pub id: u64,
    pub detached: bool,
    pub name: Option<String>,
    body: BoxFuture,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.id)
            .field("detached", &self.detached)
            .field("name", &self.name)
            .finish()
    }
}

impl From<Submission> for Continuation {
    fn from(sub: Submission) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            detached: sub.detached,
            name: sub.name,
            body: sub.body,
        }
    }
}

impl Continuation {
    /// Run the body until its next suspension point.
    ///
    /// A panicking body finishes with `Err(message)`; the worker survives.
    pub fn resume(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), String>> {
        let body = &mut self.body;
        match panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(cx))) {
            Ok(Poll::Ready(())) => Poll::Ready(Ok(())),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(panic_message(payload.as_ref()))),
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result slot shared between a continuation and the code that waits on it.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Option<T>>,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn set(&self, value: T) {
        *self.inner.lock().unwrap() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.inner.lock().unwrap().take()
    }
}
