use std::process::ExitCode;

use burrow_cli::run_cli;

#[tokio::main]
async fn main() -> ExitCode {
    // Delegate to the CLI implementation in lib.rs
    run_cli().await
}
