// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task nodes of the invocation tree.
//!
//! The outermost [`Task`] owns the runtime: it starts the workers, and its
//! drop blocks until no joined descendant is left before tearing them down.
//! Children reach the same runtime through [`Task::nested`] with the
//! parent's [`TaskContext`]; nested nodes own nothing.
//!
//! ```no_run
//! use tapa_rt::{Mode, Stream, Task};
//!
//! let s: Stream<f32> = Stream::with_depth("data", 8);
//! let (tx, rx) = (s.ostream(), s.istream());
//! Task::new()
//!     .invoke(Mode::Join, async move {
//!         for i in 0..1000 {
//!             tx.write(i as f32).await;
//!         }
//!         tx.close().await;
//!     })
//!     .invoke(Mode::Join, async move {
//!         let mut sum = 0.0;
//!         while let Some(v) = rx.next_value().await {
//!             sum += v;
//!         }
//!         rx.open().await;
//!         println!("{}", sum);
//!     });
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::config::RuntimeConfig;
use crate::context::{ContextMode, TaskContext};
use crate::device::{self, signal, DeviceArg, DeviceLoader, DeviceRun, Executable};
use crate::green::block_on;
use crate::green::task::Submission;

/// How a child invocation relates to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The top-level task's drop waits for it.
    Join,
    /// Nobody waits for it.
    Detach,
    /// Runs to completion before `invoke` returns. Inside a task body the
    /// worker keeps resuming the body's siblings meanwhile; awaiting
    /// [`Task::call`] does the same without leaving the parent's future.
    Sequential,
}

/// Hands out 0, 1, 2, ... to successive invocations.
///
/// Clones share the counter, so a clone captured per child sees the index
/// of that child's invocation.
#[derive(Debug, Clone, Default)]
pub struct Seq {
    next: Arc<AtomicUsize>,
}

impl Seq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Configures the top-level [`Task`].
#[derive(Default)]
pub struct TaskBuilder {
    workers: Option<usize>,
    mode: ContextMode,
    loader: Option<Arc<dyn DeviceLoader>>,
}

impl TaskBuilder {
    /// Pool width; wins over `TAPA_CONCURRENCY` and host detection.
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = Some(n);
        self
    }

    pub fn mode(mut self, mode: ContextMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn device_loader(mut self, loader: Arc<dyn DeviceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn build(self) -> Task {
        signal::install();
        let workers = RuntimeConfig::from_env().worker_count(self.workers);
        Task {
            ctx: TaskContext::start(self.mode, workers, self.loader),
            top: true,
        }
    }
}

/// One node of the invocation tree.
#[derive(Debug)]
pub struct Task {
    ctx: TaskContext,
    top: bool,
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl Task {
    /// A top-level task with the default runtime.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }

    /// A node sharing an existing runtime. Dropping it waits for nothing.
    pub fn nested(ctx: &TaskContext) -> Self {
        Self {
            ctx: ctx.clone(),
            top: false,
        }
    }

    /// Runtime handle to pass into child bodies.
    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn is_top(&self) -> bool {
        self.top
    }

    /// Schedule `body`. Everything the body captures was evaluated by the
    /// caller, left to right, before this call.
    pub fn invoke<F>(&self, mode: Mode, body: F) -> &Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(mode, None, body);
        self
    }

    /// [`Task::invoke`] with an instance name shown in logs.
    pub fn invoke_named<F>(&self, mode: Mode, name: impl Into<String>, body: F) -> &Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(mode, Some(name.into()), body);
        self
    }

    /// Invoke `n` instances, creating each body with `factory` in order.
    pub fn invoke_n<F, Fut>(&self, mode: Mode, n: usize, mut factory: F) -> &Self
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        for _ in 0..n {
            self.submit(mode, None, factory());
        }
        self
    }

    /// Sequential invocation from inside a task body: await the result in
    /// place and `body`'s suspensions become the caller's.
    pub fn call<F>(&self, body: F) -> F
    where
        F: Future<Output = ()>,
    {
        tracing::debug!("sequential invocation");
        body
    }

    /// Run `software`, or the device behind `exe` in its place.
    ///
    /// A software target behaves like [`Task::invoke`] and reports the
    /// body's wall-clock time. A device target is loaded and bound now, then
    /// driven by a joined continuation whatever `mode` says; it reports the
    /// device's compute time.
    pub fn invoke_external<F>(
        &self,
        mode: Mode,
        exe: &Executable,
        args: Vec<DeviceArg>,
        software: F,
    ) -> DeviceRun
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let run = DeviceRun::new();

        if exe.is_software() {
            let report = run.clone();
            self.submit(mode, None, async move {
                let start = Instant::now();
                software.await;
                report.report(Ok(start.elapsed()));
            });
            return run;
        }

        let device = match device::prepare(self.ctx.loader(), &exe.target, args) {
            Ok(device) => device,
            Err(err) => {
                tracing::error!(path = %exe.target.display(), %err, "failed to start device");
                return DeviceRun::finished(Err(err));
            }
        };
        let cleanup = device::kill_on_exit(&device);
        let report = run.clone();
        let name = exe.target.display().to_string();
        self.submit(Mode::Join, Some(name), async move {
            let result = device::drive(device, signal::interrupt_token()).await;
            if let Err(err) = &result {
                tracing::error!(%err, "device invocation failed");
            }
            report.report(result);
            drop(cleanup);
        });
        run
    }

    fn submit<F>(&self, mode: Mode, name: Option<String>, body: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match mode {
            Mode::Sequential => {
                tracing::debug!(name = name.as_deref().unwrap_or("-"), "sequential invocation");
                block_on(body);
            }
            Mode::Join | Mode::Detach => {
                if let Some(name) = &name {
                    tracing::debug!(%name, ?mode, "invoking task");
                }
                self.ctx
                    .schedule(Submission::new(mode == Mode::Detach, name, Box::pin(body)));
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !self.top {
            return;
        }
        self.ctx.wait();
        self.ctx.shutdown();
        tracing::debug!("task runtime stopped");
        if let Some(msg) = self.ctx.take_panic() {
            if !thread::panicking() {
                panic!("task body panicked: {}", msg);
            }
        }
    }
}
