//! Crash capture around the primary action.
//!
//! Faults are forwarded to a remote collector on a best-effort basis; the
//! caller always gets the action's own error back.

mod sink;

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use burrow_shared::diagnostics::{FaultKind, FaultReport};
use futures::FutureExt;
use tracing::{debug, warn};

pub use sink::{DIAGNOSTICS_URL_ENV_VAR, DiagnosticsError, DiagnosticsSink, HttpSink, NoopSink, sink_from_env};

use crate::error::{ActionPanic, StatusError};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Correlation tags attached to every report.
pub type Tags = BTreeMap<String, String>;

#[derive(Clone)]
pub struct FaultReporter {
    sink: Arc<dyn DiagnosticsSink>,
    release: String,
    timeout: Duration,
}

impl std::fmt::Debug for FaultReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultReporter")
            .field("release", &self.release)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FaultReporter {
    pub fn new(sink: Arc<dyn DiagnosticsSink>, release: impl Into<String>) -> Self {
        Self {
            sink,
            release: release.into(),
            timeout: FORWARD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `action`, converting a panic into an [`ActionPanic`] error and
    /// forwarding any fault to the sink before returning it unchanged.
    pub async fn supervise<F>(&self, tags: Tags, action: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let (result, kind) = match AssertUnwindSafe(action).catch_unwind().await {
            Ok(result) => (result, FaultKind::Error),
            Err(payload) => (
                Err(ActionPanic(panic_message(payload.as_ref())).into()),
                FaultKind::Panic,
            ),
        };

        if let Err(err) = &result {
            if err.downcast_ref::<StatusError>().is_some() {
                debug!("Action requested exit status: {err}");
            } else {
                self.forward(self.report(err, kind, tags)).await;
            }
        }

        result
    }

    pub fn report(&self, err: &anyhow::Error, kind: FaultKind, tags: Tags) -> FaultReport {
        FaultReport {
            release: self.release.clone(),
            kind,
            message: err.to_string(),
            causes: err.chain().skip(1).map(ToString::to_string).collect(),
            tags,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    /// Never fails: a sink error or timeout is logged and dropped.
    pub async fn forward(&self, report: FaultReport) {
        match tokio::time::timeout(self.timeout, self.sink.capture(&report)).await {
            Ok(Ok(())) => debug!("Forwarded {:?} report to diagnostics", report.kind),
            Ok(Err(e)) => warn!("Failed to forward diagnostics report: {e}"),
            Err(_) => warn!(
                "Failed to forward diagnostics report: {}",
                DiagnosticsError::Timeout(self.timeout)
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
