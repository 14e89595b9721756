// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-channel trace files.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Open trace file of one named channel: one written value per line, an
/// empty line per end-of-transmission marker.
pub(crate) struct LogContext {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogContext {
    /// `None` for unnamed channels, or when the file cannot be created.
    pub fn open(dir: &Path, name: &str) -> Option<Self> {
        if name.is_empty() {
            return None;
        }
        let path = dir.join(format!("{}.txt", name));
        match File::create(&path) {
            Ok(file) => {
                tracing::info!(channel = name, path = %path.display(), "channel is logged");
                Some(Self {
                    path,
                    file: Mutex::new(file),
                })
            }
            Err(err) => {
                tracing::warn!(channel = name, path = %path.display(), %err, "failed to log channel");
                None
            }
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn value(&self, rendered: &str) {
        self.line(rendered);
    }

    pub fn eot(&self) {
        self.line("");
    }

    fn line(&self, text: &str) {
        let mut file = self.file.lock().unwrap();
        if let Err(err) = write_line(&mut file, text) {
            tracing::warn!(path = %self.path.display(), %err, "failed to write channel log");
        }
    }
}

fn write_line(file: &mut File, text: &str) -> io::Result<()> {
    writeln!(file, "{}", text)?;
    file.flush()
}
