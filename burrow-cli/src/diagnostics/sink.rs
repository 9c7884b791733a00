use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use burrow_shared::diagnostics::FaultReport;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

pub const DIAGNOSTICS_URL_ENV_VAR: &str = "BURROW_DIAGNOSTICS_URL";

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("collector rejected report with status {0}")]
    Rejected(u16),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("collector did not answer within {0:?}")]
    Timeout(Duration),
}

/// Remote collector for fault reports. Fire-and-forget from the caller's side.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn capture(&self, report: &FaultReport) -> Result<(), DiagnosticsError>;
}

/// Used when no collector is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl DiagnosticsSink for NoopSink {
    async fn capture(&self, report: &FaultReport) -> Result<(), DiagnosticsError> {
        debug!("No diagnostics collector configured, dropping report: {}", report.message);
        Ok(())
    }
}

/// Posts reports as JSON to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl DiagnosticsSink for HttpSink {
    async fn capture(&self, report: &FaultReport) -> Result<(), DiagnosticsError> {
        let response = self.client.post(&self.endpoint).json(report).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiagnosticsError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// An [`HttpSink`] when `BURROW_DIAGNOSTICS_URL` is set and non-empty,
/// otherwise a [`NoopSink`].
pub fn sink_from_env() -> Arc<dyn DiagnosticsSink> {
    match std::env::var(DIAGNOSTICS_URL_ENV_VAR) {
        Ok(url) if !url.trim().is_empty() => Arc::new(HttpSink::new(url.trim())),
        _ => Arc::new(NoopSink),
    }
}
