// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! External device invocations.
//!
//! A task body can be swapped for a hardware implementation at invoke time.
//! The runtime only sees an opaque [`Device`] handle produced by a
//! [`DeviceLoader`]: arguments are bound by position, then the handle goes
//! through write, exec and read, and a joined continuation polls it until it
//! reports completion. SIGINT cancels in-flight handles (see [`signal`]).

mod process;
pub mod signal;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::DeviceError;
use crate::green::block_on;
use crate::green::task::ResultSlot;
use crate::green::yield_now::yield_because;
use crate::stream::{IStream, OStream};

/// Pause between completion polls of a running device.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Host memory shared with a device argument slot.
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Transfer direction of a memory-mapped argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTag {
    /// Host to device only.
    ReadOnly,
    /// Device to host only.
    WriteOnly,
    ReadWrite,
    /// Allocated on the device, never transferred.
    Placeholder,
}

/// Direction of a channel argument, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    Input,
    Output,
}

/// One positional argument of a device invocation.
#[derive(Clone)]
pub enum DeviceArg {
    /// Raw little-endian bytes of a fixed-layout scalar.
    Scalar(Vec<u8>),
    Buffer { tag: BufferTag, data: SharedBuffer },
    Stream { tag: StreamTag, name: String },
}

impl DeviceArg {
    pub fn buffer(tag: BufferTag, data: SharedBuffer) -> Self {
        DeviceArg::Buffer { tag, data }
    }
}

impl fmt::Debug for DeviceArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceArg::Scalar(bytes) => f.debug_tuple("Scalar").field(bytes).finish(),
            DeviceArg::Buffer { tag, data } => f
                .debug_struct("Buffer")
                .field("tag", tag)
                .field("len", &data.lock().map(|d| d.len()).unwrap_or(0))
                .finish(),
            DeviceArg::Stream { tag, name } => f
                .debug_struct("Stream")
                .field("tag", tag)
                .field("name", name)
                .finish(),
        }
    }
}

macro_rules! scalar_args {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for DeviceArg {
                fn from(value: $ty) -> Self {
                    DeviceArg::Scalar(value.to_le_bytes().to_vec())
                }
            }
        )*
    };
}

scalar_args!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl<T> From<&IStream<T>> for DeviceArg {
    fn from(stream: &IStream<T>) -> Self {
        DeviceArg::Stream {
            tag: StreamTag::Input,
            name: stream.name().to_string(),
        }
    }
}

impl<T> From<&OStream<T>> for DeviceArg {
    fn from(stream: &OStream<T>) -> Self {
        DeviceArg::Stream {
            tag: StreamTag::Output,
            name: stream.name().to_string(),
        }
    }
}

/// Handle to one loaded hardware instance.
///
/// Calls arrive in the order: argument setters, `write_to_device`, `exec`,
/// `read_from_device`, then `is_finished` until it returns true, then
/// `finish`. `kill` may arrive from another thread at any point after load.
pub trait Device: Send {
    fn set_scalar_arg(&mut self, index: usize, bytes: &[u8]) -> Result<(), DeviceError>;
    fn set_buffer_arg(
        &mut self,
        index: usize,
        tag: BufferTag,
        data: SharedBuffer,
    ) -> Result<(), DeviceError>;
    fn set_stream_arg(&mut self, index: usize, tag: StreamTag, name: &str)
        -> Result<(), DeviceError>;

    fn write_to_device(&mut self) -> Result<(), DeviceError>;
    fn exec(&mut self) -> Result<(), DeviceError>;
    fn read_from_device(&mut self) -> Result<(), DeviceError>;
    fn finish(&mut self) -> Result<(), DeviceError>;
    fn kill(&mut self);
    fn is_finished(&mut self) -> bool;

    fn compute_time(&self) -> Duration;

    fn load_time(&self) -> Duration {
        Duration::ZERO
    }

    fn store_time(&self) -> Duration {
        Duration::ZERO
    }
}

/// Produces a [`Device`] for a target path.
pub trait DeviceLoader: Send + Sync {
    fn load(&self, target: &Path) -> Result<Box<dyn Device>, DeviceError>;
}

impl<F> DeviceLoader for F
where
    F: Fn(&Path) -> Result<Box<dyn Device>, DeviceError> + Send + Sync,
{
    fn load(&self, target: &Path) -> Result<Box<dyn Device>, DeviceError> {
        self(target)
    }
}

/// Overrides where an invocation runs. An empty target keeps the software
/// body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Executable {
    pub target: PathBuf,
    pub in_new_process: bool,
}

impl Executable {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            in_new_process: false,
        }
    }

    /// The software path.
    pub fn software() -> Self {
        Self::default()
    }

    pub fn in_new_process(mut self, yes: bool) -> Self {
        self.in_new_process = yes;
        self
    }

    pub fn is_software(&self) -> bool {
        self.target.as_os_str().is_empty()
    }
}

pub(crate) type SharedDevice = Arc<Mutex<Box<dyn Device>>>;

/// Outcome of a scheduled device invocation: its compute time, or why it
/// failed.
#[derive(Clone)]
pub struct DeviceRun {
    slot: Arc<ResultSlot<Result<Duration, DeviceError>>>,
}

impl DeviceRun {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(ResultSlot::new()),
        }
    }

    pub(crate) fn finished(result: Result<Duration, DeviceError>) -> Self {
        let run = Self::new();
        run.slot.set(result);
        run
    }

    pub(crate) fn report(&self, result: Result<Duration, DeviceError>) {
        self.slot.set(result);
    }

    /// The result, once the invocation has completed. Taken at most once.
    pub fn take(&self) -> Option<Result<Duration, DeviceError>> {
        self.slot.take()
    }
}

impl fmt::Debug for DeviceRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRun").finish_non_exhaustive()
    }
}

/// Load `target` and bind `args` by position.
pub(crate) fn prepare(
    loader: Option<&Arc<dyn DeviceLoader>>,
    target: &Path,
    args: Vec<DeviceArg>,
) -> Result<SharedDevice, DeviceError> {
    let loader = loader.ok_or_else(|| DeviceError::NoLoader {
        target: target.to_path_buf(),
    })?;
    let mut device = loader.load(target)?;
    bind_args(device.as_mut(), args)?;
    tracing::info!(path = %target.display(), "device loaded");
    Ok(Arc::new(Mutex::new(device)))
}

fn bind_args(device: &mut dyn Device, args: Vec<DeviceArg>) -> Result<(), DeviceError> {
    for (index, arg) in args.into_iter().enumerate() {
        let bound = match arg {
            DeviceArg::Scalar(bytes) => device.set_scalar_arg(index, &bytes),
            DeviceArg::Buffer { tag, data } => device.set_buffer_arg(index, tag, data),
            DeviceArg::Stream { tag, name } => device.set_stream_arg(index, tag, &name),
        };
        bound.map_err(|err| DeviceError::Argument {
            index,
            reason: err.to_string(),
        })?;
    }
    Ok(())
}

/// Arm the forced-exit cleanup for `device`; disarmed when the guard drops.
pub(crate) fn kill_on_exit(device: &SharedDevice) -> signal::CleanupGuard {
    let device = device.clone();
    signal::register_cleanup(move || {
        kill_now(&device);
    })
}

/// Kill `device` unless one of its calls is still running elsewhere.
///
/// Never waits for the device: a call that hangs must not hold up the
/// forced exit. Returns whether `kill` was issued.
pub(crate) fn kill_now(device: &SharedDevice) -> bool {
    match device.try_lock() {
        Ok(mut dev) => {
            dev.kill();
            true
        }
        Err(TryLockError::Poisoned(poisoned)) => {
            poisoned.into_inner().kill();
            true
        }
        Err(TryLockError::WouldBlock) => {
            tracing::warn!("device is busy; skipping kill");
            false
        }
    }
}

/// Run a bound device to completion, suspending between completion polls.
///
/// Any cancel request on `token` made after this starts kills the device.
pub(crate) async fn drive(device: SharedDevice, token: CancelToken) -> Result<Duration, DeviceError> {
    let since = token.snapshot();
    {
        let mut dev = device.lock().unwrap();
        dev.write_to_device()?;
        dev.exec()?;
        dev.read_from_device()?;
    }

    loop {
        if token.cancelled_since(since) {
            device.lock().unwrap().kill();
            tracing::warn!("device invocation killed");
            return Err(DeviceError::Killed);
        }
        let finished = device.lock().unwrap().is_finished();
        if finished {
            break;
        }
        thread::sleep(POLL_INTERVAL);
        yield_because(|| "device is not finished".to_string()).await;
    }

    let mut dev = device.lock().unwrap();
    dev.finish()?;
    tracing::debug!(
        compute_ns = dev.compute_time().as_nanos() as u64,
        load_ns = dev.load_time().as_nanos() as u64,
        store_ns = dev.store_time().as_nanos() as u64,
        "device finished"
    );
    Ok(dev.compute_time())
}

/// A one-shot invocation outside any task tree, returning its elapsed time.
///
/// ```no_run
/// use tapa_rt::device::{Executable, ExternalInvocation};
///
/// let elapsed = ExternalInvocation::new(Executable::software())
///     .arg(42u32)
///     .run(async { /* software body */ })
///     .unwrap();
/// println!("{:?}", elapsed);
/// ```
pub struct ExternalInvocation {
    exe: Executable,
    args: Vec<DeviceArg>,
    loader: Option<Arc<dyn DeviceLoader>>,
}

impl ExternalInvocation {
    pub fn new(exe: Executable) -> Self {
        Self {
            exe,
            args: Vec::new(),
            loader: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<DeviceArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn loader(mut self, loader: Arc<dyn DeviceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Run the device, or `software` when the target is empty.
    ///
    /// The software path reports wall-clock time; the device path reports
    /// the device's own compute time.
    pub fn run<F>(self, software: F) -> Result<Duration, DeviceError>
    where
        F: Future<Output = ()>,
    {
        if self.exe.is_software() {
            tracing::info!("running software simulation");
            let start = Instant::now();
            block_on(software);
            return Ok(start.elapsed());
        }

        signal::install();
        let Self { exe, args, loader } = self;
        let in_new_process = exe.in_new_process;
        let invocation = move || {
            let device = prepare(loader.as_ref(), &exe.target, args)?;
            let _cleanup = kill_on_exit(&device);
            block_on(drive(device, signal::interrupt_token()))
        };
        if in_new_process {
            process::run_in_child(invocation)
        } else {
            invocation()
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Calls seen by a [`FakeDevice`].
    #[derive(Debug, Default)]
    pub struct Probe {
        pub calls: Mutex<Vec<String>>,
        pub killed: AtomicBool,
        pub polls: AtomicUsize,
    }

    impl Probe {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    /// Finishes after a fixed number of completion polls.
    pub struct FakeDevice {
        pub probe: Arc<Probe>,
        pub polls_to_finish: usize,
        /// When false the device never reports completion.
        pub finishes: bool,
    }

    impl Device for FakeDevice {
        fn set_scalar_arg(&mut self, index: usize, bytes: &[u8]) -> Result<(), DeviceError> {
            self.probe.record(format!("scalar {} {:?}", index, bytes));
            Ok(())
        }

        fn set_buffer_arg(
            &mut self,
            index: usize,
            tag: BufferTag,
            _data: SharedBuffer,
        ) -> Result<(), DeviceError> {
            if tag == BufferTag::Placeholder {
                return Err(DeviceError::operation("set_buffer_arg", "placeholder unsupported"));
            }
            self.probe.record(format!("buffer {} {:?}", index, tag));
            Ok(())
        }

        fn set_stream_arg(
            &mut self,
            index: usize,
            tag: StreamTag,
            name: &str,
        ) -> Result<(), DeviceError> {
            self.probe.record(format!("stream {} {:?} {}", index, tag, name));
            Ok(())
        }

        fn write_to_device(&mut self) -> Result<(), DeviceError> {
            self.probe.record("write");
            Ok(())
        }

        fn exec(&mut self) -> Result<(), DeviceError> {
            self.probe.record("exec");
            Ok(())
        }

        fn read_from_device(&mut self) -> Result<(), DeviceError> {
            self.probe.record("read");
            Ok(())
        }

        fn finish(&mut self) -> Result<(), DeviceError> {
            self.probe.record("finish");
            Ok(())
        }

        fn kill(&mut self) {
            self.probe.killed.store(true, Ordering::Release);
        }

        fn is_finished(&mut self) -> bool {
            let polls = self.probe.polls.fetch_add(1, Ordering::AcqRel) + 1;
            self.finishes && polls >= self.polls_to_finish
        }

        fn compute_time(&self) -> Duration {
            Duration::from_micros(7)
        }
    }

    pub fn loader(probe: Arc<Probe>, polls_to_finish: usize, finishes: bool) -> Arc<dyn DeviceLoader> {
        Arc::new(move |_: &Path| -> Result<Box<dyn Device>, DeviceError> {
            Ok(Box::new(FakeDevice {
                probe: probe.clone(),
                polls_to_finish,
                finishes,
            }))
        })
    }
}
