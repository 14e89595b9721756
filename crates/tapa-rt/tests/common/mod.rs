// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tapa_rt::device::{BufferTag, Device, DeviceLoader, SharedBuffer, StreamTag};
use tapa_rt::DeviceError;

/// Route runtime logs to the test harness. `RUST_LOG` filters them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a [`MockDevice`] went through.
#[derive(Debug, Default)]
pub struct Counters {
    pub args: AtomicUsize,
    pub polls: AtomicUsize,
    pub finished: AtomicBool,
    pub killed: AtomicBool,
}

/// A device that reports completion after `latency` polls, or never.
pub struct MockDevice {
    counters: Arc<Counters>,
    latency: Option<usize>,
}

impl Device for MockDevice {
    fn set_scalar_arg(&mut self, _index: usize, _bytes: &[u8]) -> Result<(), DeviceError> {
        self.counters.args.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_buffer_arg(
        &mut self,
        _index: usize,
        _tag: BufferTag,
        _data: SharedBuffer,
    ) -> Result<(), DeviceError> {
        self.counters.args.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_stream_arg(
        &mut self,
        _index: usize,
        _tag: StreamTag,
        _name: &str,
    ) -> Result<(), DeviceError> {
        self.counters.args.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_to_device(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn exec(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn read_from_device(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), DeviceError> {
        self.counters.finished.store(true, Ordering::Release);
        Ok(())
    }

    fn kill(&mut self) {
        self.counters.killed.store(true, Ordering::Release);
    }

    fn is_finished(&mut self) -> bool {
        let polls = self.counters.polls.fetch_add(1, Ordering::AcqRel) + 1;
        self.latency.is_some_and(|n| polls >= n)
    }

    fn compute_time(&self) -> Duration {
        Duration::from_millis(3)
    }
}

pub fn mock_loader(counters: Arc<Counters>, latency: Option<usize>) -> Arc<dyn DeviceLoader> {
    Arc::new(move |_: &Path| -> Result<Box<dyn Device>, DeviceError> {
        Ok(Box::new(MockDevice {
            counters: counters.clone(),
            latency,
        }))
    })
}
