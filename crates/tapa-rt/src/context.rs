// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime context.
//!
//! Created once by the outermost [`crate::Task`] and handed explicitly to
//! every nested task. Carries the executor, the device loader, and the
//! poison slot that makes task-body panics fatal to the top-level task.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::device::signal::{self, HookGuard};
use crate::device::DeviceLoader;
use crate::green::pool::{Poison, WorkerPool};
use crate::green::task::Submission;
use crate::spawn::ThreadSet;

/// How the runtime executes tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    /// Worker threads multiplexing cooperative continuations.
    #[default]
    Coroutine,
    /// One OS thread per invocation.
    ThreadBacked,
}

enum Executor {
    Pool(WorkerPool),
    Threads(ThreadSet),
}

pub(crate) struct Runtime {
    mode: ContextMode,
    executor: Executor,
    poison: Arc<Poison>,
    loader: Option<Arc<dyn DeviceLoader>>,
    _interrupt_hook: HookGuard,
}

/// Shared handle to one runtime. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    rt: Arc<Runtime>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("mode", &self.rt.mode)
            .field("workers", &self.worker_count())
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn start(
        mode: ContextMode,
        workers: usize,
        loader: Option<Arc<dyn DeviceLoader>>,
    ) -> Self {
        let poison = Arc::new(Poison::default());
        let executor = match mode {
            ContextMode::Coroutine => Executor::Pool(WorkerPool::new(workers, poison.clone())),
            ContextMode::ThreadBacked => Executor::Threads(ThreadSet::new(poison.clone())),
        };

        let rt = Arc::new_cyclic(|weak: &Weak<Runtime>| {
            let weak = weak.clone();
            let hook = signal::on_interrupt(move || {
                if let Some(rt) = weak.upgrade() {
                    if let Executor::Pool(pool) = &rt.executor {
                        pool.request_debug();
                    }
                }
            });
            Runtime {
                mode,
                executor,
                poison,
                loader,
                _interrupt_hook: hook,
            }
        });

        tracing::info!(?mode, workers = workers, "task runtime started");
        Self { rt }
    }

    pub fn mode(&self) -> ContextMode {
        self.rt.mode
    }

    /// Pool width, or 0 in thread-backed mode.
    pub fn worker_count(&self) -> usize {
        match &self.rt.executor {
            Executor::Pool(pool) => pool.width(),
            Executor::Threads(_) => 0,
        }
    }

    pub(crate) fn schedule(&self, sub: Submission) {
        match &self.rt.executor {
            Executor::Pool(pool) => {
                let worker = pool.add_task(sub);
                tracing::trace!(worker, "task scheduled");
            }
            Executor::Threads(threads) => threads.spawn(sub),
        }
    }

    /// Block until no joined task remains runnable anywhere in the runtime.
    pub fn wait(&self) {
        match &self.rt.executor {
            Executor::Pool(pool) => pool.wait(),
            Executor::Threads(threads) => threads.wait(),
        }
    }

    /// Ask every worker to log why its continuations are suspended.
    pub fn request_debug(&self) {
        if let Executor::Pool(pool) = &self.rt.executor {
            pool.request_debug();
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Executor::Pool(pool) = &self.rt.executor {
            pool.shutdown();
        }
    }

    pub(crate) fn take_panic(&self) -> Option<String> {
        self.rt.poison.take()
    }

    pub(crate) fn loader(&self) -> Option<&Arc<dyn DeviceLoader>> {
        self.rt.loader.as_ref()
    }
}
