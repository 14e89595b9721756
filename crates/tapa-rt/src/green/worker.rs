// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One OS thread running a cooperative round-robin scheduler.
//!
//! Each loop pass drains the submission queue into new continuations, then
//! resumes every live continuation exactly once. Once no joined continuation
//! is left the idle condvar is signalled. With nothing to run at all the
//! thread parks briefly on the submission condvar instead of spinning.
//! Shutdown still turns already-queued submissions into continuations and
//! gives them one pass before the loop stops.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::pool::Poison;
use super::task::{Continuation, Submission};
use super::yield_now::{pass_waker, set_debug};

/// How long an idle worker sleeps before re-checking for work.
const IDLE_PARK: Duration = Duration::from_millis(5);

/// How often `wait()` re-checks the poison flag.
const WAIT_TICK: Duration = Duration::from_millis(10);

struct WorkerState {
    submissions: VecDeque<Submission>,
    /// Joined work submitted here that has not returned yet, queued or live.
    pending_joined: usize,
    done: bool,
}

/// State shared between the worker thread and its submitters.
struct Shared {
    id: usize,
    state: Mutex<WorkerState>,
    task_cv: Condvar,
    idle_cv: Condvar,
    debug: AtomicBool,
    poison: Arc<Poison>,
    /// Joined work outstanding across the whole pool.
    outstanding: Arc<AtomicUsize>,
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn(id: usize, poison: Arc<Poison>, outstanding: Arc<AtomicUsize>) -> Self {
        let shared = Arc::new(Shared {
            id,
            state: Mutex::new(WorkerState {
                submissions: VecDeque::new(),
                pending_joined: 0,
                done: false,
            }),
            task_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            debug: AtomicBool::new(false),
            poison,
            outstanding,
        });

        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("tapa-worker-{}", id))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread")
        };

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Enqueue a body. It becomes a continuation on the worker's next pass.
    pub fn submit(&self, sub: Submission) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.done {
                tracing::warn!(
                    worker = self.shared.id,
                    "task submitted after runtime shutdown; dropped"
                );
                return;
            }
            if !sub.detached {
                state.pending_joined += 1;
                self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
            }
            state.submissions.push_back(sub);
        }
        self.shared.task_cv.notify_one();
    }

    /// Block until no joined work remains here, or the runtime is poisoned.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.pending_joined > 0 && !self.shared.poison.is_poisoned() {
            state = self
                .shared
                .idle_cv
                .wait_timeout(state, WAIT_TICK)
                .unwrap()
                .0;
        }
    }

    /// Log the suspension reason of every live continuation on the next pass.
    pub fn request_debug(&self) {
        self.shared.debug.store(true, Ordering::Release);
    }

    /// Stop the loop and join the thread. Detached continuations are dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.done = true;
        }
        self.shared.task_cv.notify_all();

        let Some(handle) = self.thread.lock().unwrap().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!(worker = self.shared.id, "worker thread panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker-thread view of one worker: its shared half plus the live set.
struct Local {
    shared: Arc<Shared>,
    /// Never borrowed across a resume, so a nested pass can rotate it.
    live: RefCell<VecDeque<Continuation>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Local>>> = const { RefCell::new(None) };
}

impl Local {
    /// Turn queued submissions into continuations. Returns false once the
    /// worker is shutting down and nothing is left in the queue.
    fn accept(&self, park: bool) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if park && state.submissions.is_empty() && self.live.borrow().is_empty() && !state.done {
            state = self.shared.task_cv.wait_timeout(state, IDLE_PARK).unwrap().0;
        }
        if state.done && state.submissions.is_empty() {
            return false;
        }
        self.live
            .borrow_mut()
            .extend(state.submissions.drain(..).map(Continuation::from));
        true
    }

    /// Resume every continuation that is live when the pass starts.
    fn resume_all(&self, debugging: bool) -> usize {
        let waker = pass_waker();
        let mut cx = Context::from_waker(&waker);
        let count = self.live.borrow().len();
        let mut resumed = 0;
        for _ in 0..count {
            let Some(mut c) = self.live.borrow_mut().pop_front() else {
                break;
            };
            resumed += 1;
            let _task = debugging
                .then(|| tracing::info_span!("task", name = c.label(), id = c.id).entered());
            match c.resume(&mut cx) {
                Poll::Pending => self.live.borrow_mut().push_back(c),
                Poll::Ready(result) => {
                    if let Err(msg) = result {
                        tracing::error!(task = c.label(), id = c.id, "task body panicked: {}", msg);
                        self.shared.poison.set(msg);
                    }
                    if !c.detached {
                        self.joined_finished();
                    }
                }
            }
        }
        if !self.live.borrow().iter().any(|c| !c.detached) {
            self.shared.idle_cv.notify_all();
        }
        resumed
    }

    fn joined_finished(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.pending_joined -= 1;
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let _span = tracing::debug_span!("worker", id = shared.id).entered();
    let local = Rc::new(Local {
        shared,
        live: RefCell::new(VecDeque::new()),
    });
    CURRENT.with(|current| *current.borrow_mut() = Some(local.clone()));

    while local.accept(true) {
        let debugging = local.shared.debug.swap(false, Ordering::AcqRel);
        if debugging {
            tracing::info!(live = local.live.borrow().len(), "dumping suspended continuations");
            set_debug(true);
        }
        local.resume_all(debugging);
        if debugging {
            set_debug(false);
        }
    }

    CURRENT.with(|current| current.borrow_mut().take());
    tracing::debug!(dropped = local.live.borrow().len(), "worker stopped");
}

/// Run one pass over the current worker's other continuations.
///
/// Called by [`super::block_on`] between polls, so a body that blocks on a
/// sequential child still lets its siblings on the same worker make
/// progress. Returns false off worker threads, or when nothing ran.
pub(crate) fn run_nested_pass() -> bool {
    let Some(local) = CURRENT.with(|current| current.borrow().clone()) else {
        return false;
    };
    local.accept(false);
    local.resume_all(false) > 0
}
