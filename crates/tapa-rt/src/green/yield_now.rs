// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The single suspension point.
//!
//! Every blocking channel operation and every device-completion poll ends
//! up here. Inside a worker continuation, `Pending` hands control back to the
//! worker loop, which moves on to the next continuation. Under [`block_on`]
//! there is no scheduler to return to, so each `Pending` becomes an OS-thread
//! yield.

use std::cell::Cell;
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use super::worker;

thread_local! {
    /// Set by a worker for one pass after a debug request.
    static DEBUG: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn set_debug(on: bool) {
    DEBUG.with(|d| d.set(on));
}

/// Suspend the current continuation once.
pub async fn yield_now() {
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                return Poll::Ready(());
            }
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    YieldOnce(false).await
}

/// Suspend once, reporting why when the worker is in debug mode.
pub(crate) async fn yield_because<F>(reason: F)
where
    F: FnOnce() -> String,
{
    if DEBUG.with(Cell::get) {
        tracing::info!(reason = %reason(), "continuation suspended");
    }
    yield_now().await
}

/// Continuations are re-polled every pass, so wake-ups carry no information.
pub(crate) struct PassWaker;

impl Wake for PassWaker {
    fn wake(self: Arc<Self>) {}
    fn wake_by_ref(self: &Arc<Self>) {}
}

pub(crate) fn pass_waker() -> Waker {
    Waker::from(Arc::new(PassWaker))
}

/// Drive `fut` to completion on the calling thread.
///
/// This is the plain-thread path: sequential invocations, the thread-backed
/// runtime mode, and host code outside any task all use it. On a worker
/// thread each `Pending` runs one pass over the worker's other
/// continuations instead, so the worker is never held by a single body.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = pin!(fut);
    let waker = pass_waker();
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }
        if !worker::run_nested_pass() {
            std::thread::yield_now();
        }
    }
}
