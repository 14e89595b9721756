// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Environment-driven runtime configuration.
//!
//! Builder arguments win over the environment; the environment wins over
//! host detection. Malformed values are reported and ignored.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::thread;

use crate::error::ConfigError;

/// Overrides the auto-detected worker count.
pub const CONCURRENCY_ENV: &str = "TAPA_CONCURRENCY";
/// Directory receiving one trace file per named channel.
pub const STREAM_LOG_DIR_ENV: &str = "TAPA_STREAM_LOG_DIR";
/// How many undrained values a channel dumps when dropped with leftovers.
pub const LEFTOVER_LOG_COUNT_ENV: &str = "TAPA_STREAM_LEFTOVER_LOG_COUNT";

pub const DEFAULT_LEFTOVER_LOG_COUNT: usize = 10;

const CPUINFO: &str = "/proc/cpuinfo";

/// Used when the host refuses to report its parallelism.
const FALLBACK_WORKERS: usize = 4;

/// Snapshot of the runtime's environment knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub workers: Option<usize>,
    pub stream_log_dir: Option<PathBuf>,
    pub leftover_log_count: usize,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            workers: concurrency_hint(),
            stream_log_dir: stream_log_dir(),
            leftover_log_count: leftover_log_count(),
        }
    }

    /// Worker count: explicit argument, then the environment, then the host.
    pub fn worker_count(&self, explicit: Option<usize>) -> usize {
        explicit
            .filter(|&n| n > 0)
            .or(self.workers)
            .unwrap_or_else(host_parallelism)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: None,
            stream_log_dir: None,
            leftover_log_count: DEFAULT_LEFTOVER_LOG_COUNT,
        }
    }
}

/// Physical core count of the host, falling back to logical CPUs when
/// `/proc/cpuinfo` is unavailable or lists no core ids.
pub fn host_parallelism() -> usize {
    let physical = fs::read_to_string(CPUINFO)
        .map(|text| physical_cores(&text))
        .unwrap_or(0);
    if physical > 0 {
        return physical;
    }
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(FALLBACK_WORKERS)
}

/// Distinct `(physical id, core id)` pairs in a cpuinfo listing.
fn physical_cores(cpuinfo: &str) -> usize {
    let mut cores = HashSet::new();
    let mut package = None;
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().parse::<u32>().ok();
        match key.trim() {
            "processor" => package = None,
            "physical id" => package = value,
            "core id" => {
                if let Some(core) = value {
                    cores.insert((package, core));
                }
            }
            _ => {}
        }
    }
    cores.len()
}

pub fn concurrency_hint() -> Option<usize> {
    let value = std::env::var(CONCURRENCY_ENV).ok()?;
    match parse_positive(CONCURRENCY_ENV, &value) {
        Ok(n) => Some(n),
        Err(err) => {
            tracing::warn!(%err, "ignoring concurrency hint");
            None
        }
    }
}

pub fn stream_log_dir() -> Option<PathBuf> {
    std::env::var_os(STREAM_LOG_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn leftover_log_count() -> usize {
    let Ok(value) = std::env::var(LEFTOVER_LOG_COUNT_ENV) else {
        return DEFAULT_LEFTOVER_LOG_COUNT;
    };
    parse_count(LEFTOVER_LOG_COUNT_ENV, &value).unwrap_or_else(|err| {
        tracing::warn!(%err, "using default leftover log count");
        DEFAULT_LEFTOVER_LOG_COUNT
    })
}

pub(crate) fn parse_positive(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::NotPositive {
            var,
            value: value.to_string(),
        }),
    }
}

pub(crate) fn parse_count(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| ConfigError::NotCount {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_values_parse() {
        assert_eq!(parse_positive(CONCURRENCY_ENV, "8"), Ok(8));
        assert_eq!(parse_positive(CONCURRENCY_ENV, " 2 "), Ok(2));
    }

    #[test]
    fn zero_and_garbage_rejected() {
        assert!(parse_positive(CONCURRENCY_ENV, "0").is_err());
        assert!(parse_positive(CONCURRENCY_ENV, "-3").is_err());
        assert!(parse_positive(CONCURRENCY_ENV, "many").is_err());
    }

    #[test]
    fn counts_allow_zero() {
        assert_eq!(parse_count(LEFTOVER_LOG_COUNT_ENV, "0"), Ok(0));
        assert!(parse_count(LEFTOVER_LOG_COUNT_ENV, "ten").is_err());
    }

    #[test]
    fn explicit_worker_count_wins() {
        let config = RuntimeConfig {
            workers: Some(3),
            ..RuntimeConfig::default()
        };
        assert_eq!(config.worker_count(Some(5)), 5);
        assert_eq!(config.worker_count(None), 3);
        assert_eq!(config.worker_count(Some(0)), 3);
    }

    #[test]
    fn hyperthreads_share_a_core() {
        let cpuinfo = "\
processor\t: 0
physical id\t: 0
core id\t\t: 0

processor\t: 1
physical id\t: 0
core id\t\t: 1

processor\t: 2
physical id\t: 0
core id\t\t: 0

processor\t: 3
physical id\t: 0
core id\t\t: 1
";
        assert_eq!(physical_cores(cpuinfo), 2);
    }

    #[test]
    fn sockets_are_counted_separately() {
        let cpuinfo = "\
processor : 0
physical id : 0
core id : 0

processor : 1
physical id : 1
core id : 0
";
        assert_eq!(physical_cores(cpuinfo), 2);
    }

    #[test]
    fn listing_without_core_ids_counts_nothing() {
        assert_eq!(physical_cores("processor : 0\nmodel name : arm\n"), 0);
    }

    #[test]
    fn host_fallback_is_positive() {
        let config = RuntimeConfig::default();
        assert!(config.worker_count(None) >= 1);
    }
}
