//! Prometheus metrics.
//!
//! # Metrics
//! - `build_info` (gauge): always 1, labelled with version, commit and rustc

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub const BUILD_INFO: &str = "build_info";

/// Set the `build_info` gauge on the installed recorder.
pub fn register_build_info(version: &str) {
    gauge!(
        BUILD_INFO,
        "version" => version.to_string(),
        "commit" => env!("GIT_COMMIT"),
        "rustc" => env!("RUSTC_VERSION"),
    )
    .set(1.0);
}

/// Install the global recorder and serve `/metrics` on `addr`.
///
/// Must run inside the tokio runtime; the listener lives as long as it does.
pub fn install_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to start metrics server on {addr}"))?;
    info!("Serving metrics on http://{}/metrics", addr);
    Ok(())
}
