// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! SIGINT handling for in-flight device invocations.
//!
//! The handler itself only touches atomics: it bumps the process-wide
//! interrupt token and records the time. A watcher thread does the rest.
//! On the first interrupt it runs the interrupt hooks (runtimes use this to
//! dump suspended continuations); pollers of the token kill their devices.
//! A second interrupt within [`DOUBLE_INTERRUPT_WINDOW`] makes the watcher
//! run every registered cleanup once and exit the process.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;

pub const DOUBLE_INTERRUPT_WINDOW: Duration = Duration::from_millis(500);

const WATCH_TICK: Duration = Duration::from_millis(10);

static INSTALL: Once = Once::new();
static INTERRUPT: OnceLock<CancelToken> = OnceLock::new();
static LAST_SIGNAL_NS: AtomicU64 = AtomicU64::new(0);
static PENDING: AtomicU64 = AtomicU64::new(0);
static FORCE_EXIT: AtomicBool = AtomicBool::new(false);
static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

type Hook = Arc<dyn Fn() + Send + Sync>;
type Cleanup = Box<dyn FnOnce() + Send>;

/// Interrupt hooks and shutdown cleanups, keyed by registration id.
pub(crate) struct Registry {
    next_id: u64,
    hooks: Vec<(u64, Hook)>,
    cleanups: Vec<(u64, Cleanup)>,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            next_id: 0,
            hooks: Vec::new(),
            cleanups: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_hook(&mut self, hook: Hook) -> u64 {
        let id = self.next_id();
        self.hooks.push((id, hook));
        id
    }

    pub fn add_cleanup(&mut self, cleanup: Cleanup) -> u64 {
        let id = self.next_id();
        self.cleanups.push((id, cleanup));
        id
    }

    pub fn remove(&mut self, id: u64) {
        self.hooks.retain(|(h, _)| *h != id);
        self.cleanups.retain(|(c, _)| *c != id);
    }

    pub fn hooks(&self) -> Vec<Hook> {
        self.hooks.iter().map(|(_, h)| h.clone()).collect()
    }

    /// Remove and return every cleanup; each runs at most once.
    pub fn take_cleanups(&mut self) -> Vec<Cleanup> {
        self.cleanups.drain(..).map(|(_, c)| c).collect()
    }
}

/// Unregisters an interrupt hook on drop.
#[derive(Debug)]
pub struct HookGuard {
    id: u64,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        REGISTRY.lock().unwrap().remove(self.id);
    }
}

/// Unregisters a shutdown cleanup on drop, without running it.
#[derive(Debug)]
pub struct CleanupGuard {
    id: u64,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        REGISTRY.lock().unwrap().remove(self.id);
    }
}

/// Install the SIGINT handler and its watcher thread. Idempotent.
pub fn install() {
    INSTALL.call_once(|| {
        interrupt_token();
        if let Err(err) = install_handler() {
            tracing::warn!(%err, "failed to install SIGINT handler");
            return;
        }
        let spawned = thread::Builder::new()
            .name("tapa-signal".to_string())
            .spawn(watch);
        if let Err(err) = spawned {
            tracing::warn!(%err, "failed to spawn signal watcher");
        }
    });
}

/// Token bumped once per SIGINT.
pub fn interrupt_token() -> CancelToken {
    INTERRUPT.get_or_init(CancelToken::new).clone()
}

/// Run `hook` on the watcher thread after every single SIGINT.
pub fn on_interrupt(hook: impl Fn() + Send + Sync + 'static) -> HookGuard {
    let id = REGISTRY.lock().unwrap().add_hook(Arc::new(hook));
    HookGuard { id }
}

/// Run `cleanup` once if the process is forced down by a double SIGINT.
pub fn register_cleanup(cleanup: impl FnOnce() + Send + 'static) -> CleanupGuard {
    let id = REGISTRY.lock().unwrap().add_cleanup(Box::new(cleanup));
    CleanupGuard { id }
}

/// Whether a signal at `now` following one at `last` forces an exit.
pub(crate) fn is_double_interrupt(last_ns: u64, now_ns: u64) -> bool {
    last_ns != 0 && now_ns.saturating_sub(last_ns) < DOUBLE_INTERRUPT_WINDOW.as_nanos() as u64
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer; clock_gettime is async-signal-safe.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

extern "C" fn handle_sigint(_signal: libc::c_int) {
    let now = monotonic_ns();
    let last = LAST_SIGNAL_NS.swap(now, Ordering::AcqRel);
    if is_double_interrupt(last, now) {
        FORCE_EXIT.store(true, Ordering::Release);
    }
    PENDING.fetch_add(1, Ordering::AcqRel);
    if let Some(token) = INTERRUPT.get() {
        token.cancel();
    }
}

fn install_handler() -> io::Result<()> {
    let handler: extern "C" fn(libc::c_int) = handle_sigint;
    // SAFETY: the action struct is fully initialised before use and the
    // handler only performs async-signal-safe operations.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn watch() {
    loop {
        thread::sleep(WATCH_TICK);

        if FORCE_EXIT.load(Ordering::Acquire) {
            tracing::info!(
                window_ms = DOUBLE_INTERRUPT_WINDOW.as_millis() as u64,
                "caught SIGINT twice; exit"
            );
            run_cleanups();
            std::process::exit(libc::EXIT_FAILURE);
        }

        if PENDING.swap(0, Ordering::AcqRel) > 0 {
            tracing::info!("caught SIGINT");
            let hooks = REGISTRY.lock().unwrap().hooks();
            for hook in hooks {
                hook();
            }
        }
    }
}

fn run_cleanups() {
    let cleanups = REGISTRY.lock().unwrap().take_cleanups();
    tracing::info!(count = cleanups.len(), "running shutdown cleanups");
    for cleanup in cleanups {
        cleanup();
    }
}
