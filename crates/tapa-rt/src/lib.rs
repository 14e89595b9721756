// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! TAPA host runtime: software execution of task-parallel dataflow designs.
//!
//! A design is a tree of tasks wired by point-to-point channels. The runtime
//! runs it on the host with the same handshake semantics the hardware has,
//! or swaps individual tasks for real devices.
//!
//! Components:
//! - task: invocation tree with join/detach/sequential modes
//! - stream: backpressured FIFOs with end-of-transmission markers
//! - green: worker pool multiplexing task bodies as cooperative continuations
//! - spawn: thread-per-task compatibility mode
//! - device: external device invocations, SIGINT cancellation
//! - config: environment knobs

pub mod cancel;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod green;
mod spawn;
pub mod stream;
pub mod task;

pub use cancel::CancelToken;
pub use config::RuntimeConfig;
pub use context::{ContextMode, TaskContext};
pub use device::{DeviceArg, DeviceRun, Executable, ExternalInvocation};
pub use error::{ConfigError, DeviceError};
pub use green::{block_on, yield_now};
pub use stream::{IStream, IStreams, OStream, OStreams, Stream, Streams, Token};
pub use task::{Mode, Seq, Task, TaskBuilder};
