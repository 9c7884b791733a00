//! The two process-wide shutdown signals.
//!
//! *forced*: stop now, abandoning in-flight work.
//! *graceful*: finish the current unit of work, accept nothing new, exit.
//!
//! Both are one-shot: they go from open to closed once and stay closed.
//! Subsystems only ever see [`ShutdownHandles`], which can observe closure
//! but cannot cause it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::info;

/// External requests the host environment can make at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTrigger {
    ForceStop,
    GracefulStop,
}

#[derive(Debug)]
struct Signal {
    name: &'static str,
    token: CancellationToken,
    closed: AtomicBool,
}

impl Signal {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        info!("{} shutdown signal closed", self.name);
        self.token.cancel();
        true
    }
}

/// Owner of both signals. Held by the dispatcher and the host integration.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    forced: Arc<Signal>,
    graceful: Arc<Signal>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            forced: Signal::new("forced"),
            graceful: Signal::new("graceful"),
        }
    }

    /// Returns `true` only for the call that actually closed the signal.
    pub fn close_forced(&self) -> bool {
        self.forced.close()
    }

    /// Returns `true` only for the call that actually closed the signal.
    pub fn close_graceful(&self) -> bool {
        self.graceful.close()
    }

    pub fn trigger(&self, trigger: HostTrigger) -> bool {
        match trigger {
            HostTrigger::ForceStop => self.close_forced(),
            HostTrigger::GracefulStop => self.close_graceful(),
        }
    }

    pub fn handles(&self) -> ShutdownHandles {
        ShutdownHandles {
            forced: ShutdownWatch {
                token: self.forced.token.clone(),
            },
            graceful: ShutdownWatch {
                token: self.graceful.token.clone(),
            },
        }
    }
}

/// Read-only view of one signal.
#[derive(Debug, Clone)]
pub struct ShutdownWatch {
    token: CancellationToken,
}

impl ShutdownWatch {
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has closed; immediately if it already has.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// The pair of read-only views handed to every subsystem.
#[derive(Debug, Clone)]
pub struct ShutdownHandles {
    pub forced: ShutdownWatch,
    pub graceful: ShutdownWatch,
}

impl ShutdownHandles {
    /// True once either signal closed: no new work should be started.
    pub fn is_stopping(&self) -> bool {
        self.forced.is_closed() || self.graceful.is_closed()
    }

    /// Resolves once either signal closes.
    pub async fn stopping(&self) {
        tokio::select! {
            _ = self.forced.closed() => {}
            _ = self.graceful.closed() => {}
        }
    }
}
