pub mod access;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod registry;
pub mod telemetry;
pub mod tunnel;
pub mod update;
pub mod util;

// === CLI entrypoint ===
pub mod cli;

pub use error::exit_code;

/// Entrypoint used by `main.rs` to run the full CLI.
pub async fn run_cli() -> std::process::ExitCode {
    cli::cli().await
}
