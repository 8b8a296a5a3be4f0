//! Signal handling for the daemon's driver loop.
//!
//! SIGTERM and SIGINT request shutdown; SIGHUP requests a configuration
//! reload. The raw handlers only store to atomics. The driver loop polls
//! [`SignalHandler`] between `process` calls, so the longest reaction time
//! is one sleep of `driver.max_sleep`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Signal types that the daemon handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate,
    /// SIGINT (Ctrl+C).
    Interrupt,
    /// SIGHUP, treated as a reload request.
    Hangup,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

// Written from async signal context, drained by `SignalHandler::poll`.
static PENDING_TERMINATE: AtomicBool = AtomicBool::new(false);
static PENDING_INTERRUPT: AtomicBool = AtomicBool::new(false);
static PENDING_HANGUP: AtomicBool = AtomicBool::new(false);

/// Flags shared between the signal glue and the driver loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    reload_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Create a state with no requests pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Whether a reload has been requested; clears the flag.
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::Relaxed)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    /// Request reload.
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Relaxed);
    }

    fn record(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        info!(signal = %kind, "Signal received");
        match kind {
            SignalKind::Terminate | SignalKind::Interrupt => self.request_shutdown(),
            SignalKind::Hangup => self.request_reload(),
        }
    }

    /// Total number of signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

/// Polling handle over the process signal flags.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Create a handler and install the Unix signal handlers.
    pub fn new() -> std::io::Result<Self> {
        let handler = Self::detached();
        #[cfg(unix)]
        install_unix_handlers()?;
        Ok(handler)
    }

    /// Create a handler without touching process signal dispositions.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    /// Move pending raw signals into the shared state.
    pub fn poll(&self) {
        let pending = [
            (&PENDING_TERMINATE, SignalKind::Terminate),
            (&PENDING_INTERRUPT, SignalKind::Interrupt),
            (&PENDING_HANGUP, SignalKind::Hangup),
        ];
        for (flag, kind) in pending {
            if flag.swap(false, Ordering::Relaxed) {
                self.state.record(kind);
            }
        }
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Whether a reload has been requested; clears the flag.
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.state.take_reload_request()
    }

    /// Request shutdown from inside the process.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Shared state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(unix)]
fn install_unix_handlers() -> std::io::Result<()> {
    use std::os::raw::c_int;

    extern "C" fn on_sigterm(_: c_int) {
        PENDING_TERMINATE.store(true, Ordering::Relaxed);
    }

    extern "C" fn on_sigint(_: c_int) {
        PENDING_INTERRUPT.store(true, Ordering::Relaxed);
    }

    extern "C" fn on_sighup(_: c_int) {
        PENDING_HANGUP.store(true, Ordering::Relaxed);
    }

    let handlers: [(c_int, extern "C" fn(c_int)); 3] = [
        (libc::SIGTERM, on_sigterm),
        (libc::SIGINT, on_sigint),
        (libc::SIGHUP, on_sighup),
    ];
    for (signal, handler) in handlers {
        // SAFETY: the handlers only perform atomic stores.
        let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    debug!("Unix signal handlers registered");
    Ok(())
}
