//! Cooperative cancellation for one processing run.
//!
//! [`RunScope`] hooks SIGTERM/SIGINT into a [`CancelFlag`] for as long as the
//! scope lives and unhooks them on drop, so nothing stays registered once a
//! run is over. Long waits poll the flag instead of blocking.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::SigId;
use signal_hook::consts::{SIGINT, SIGTERM};

/// Granularity of cancellable sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

// ──────────────────── cancel flag ────────────────────

/// Shared "stop as soon as practical" flag.
///
/// `Ordering::Relaxed` is enough: readers only poll it between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Request cancellation programmatically.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Sleep for `duration` in short slices. Returns `false` if cancelled
    /// before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    fn raw(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

// ──────────────────── run scope ────────────────────

/// Signal registrations tied to a single run.
pub struct RunScope {
    cancel: CancelFlag,
    registrations: Vec<SigId>,
}

impl RunScope {
    /// Register SIGTERM and SIGINT to set the scope's cancel flag.
    ///
    /// Registration is best-effort; failures are reported to stderr and the
    /// run proceeds without signal-driven cancellation.
    #[must_use]
    pub fn install() -> Self {
        let cancel = CancelFlag::new();
        let mut registrations = Vec::with_capacity(2);
        for (signal, name) in [(SIGTERM, "SIGTERM"), (SIGINT, "SIGINT")] {
            match signal_hook::flag::register(signal, cancel.raw()) {
                Ok(id) => registrations.push(id),
                Err(e) => eprintln!("[TSM-SIGNAL] failed to register {name}: {e}"),
            }
        }
        Self {
            cancel,
            registrations,
        }
    }

    /// A scope driven only by an existing flag (embedding, tests).
    #[must_use]
    pub fn detached(cancel: CancelFlag) -> Self {
        Self {
            cancel,
            registrations: Vec::new(),
        }
    }

    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of live OS signal registrations.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.registrations.len()
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        for id in self.registrations.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
