use std::process::ExitCode;
use std::sync::Arc;

use crate::access::AccessSubsystem;
use crate::diagnostics::sink_from_env;
use crate::error::{StatusError, exit_code};
use crate::lifecycle::App;
use crate::tunnel::TunnelSubsystem;
use crate::update::{GithubReleases, UpdateSource, UpdateSubsystem};

const ABOUT: &str = "burrow - expose local services through the edge";

const LONG_ABOUT: &str = "burrow connects a local web server to the edge, so it can be reached \
under a public hostname without opening inbound ports.\n\n\
Run without a command to start the tunnel. Flags can also be set through their \
environment variables or a YAML configuration file whose keys are flag names.";

const NOTICE: &str = "Copyright (C) the burrow authors. \
Licensed under the Apache License, Version 2.0.";

fn long_version() -> String {
    format!(
        "{} (commit {}, built with {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT"),
        env!("RUSTC_VERSION"),
    )
}

/// The agent with its built-in subsystems.
pub fn app() -> App {
    let updater: Arc<dyn UpdateSource> = Arc::new(GithubReleases::default());
    let tunnel = TunnelSubsystem::new(updater.clone());

    App::new("burrow", env!("CARGO_PKG_VERSION"))
        .about(ABOUT)
        .long_about(LONG_ABOUT)
        .after_help(NOTICE)
        .long_version(long_version())
        .contributor(Arc::new(tunnel.clone()))
        .contributor(Arc::new(AccessSubsystem::new()))
        .contributor(Arc::new(UpdateSubsystem::new(updater)))
        .default_action(tunnel.start_action())
        .diagnostics(sink_from_env())
}

pub async fn cli() -> ExitCode {
    let result = app().run(std::env::args_os()).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(usage) = err.downcast_ref::<clap::Error>() {
                // help and version land here too
                let _ = usage.print();
            } else if let Some(status) = err.downcast_ref::<StatusError>() {
                eprintln!("{status}");
            } else {
                eprintln!("Error: {err:#}");
            }
            ExitCode::from(exit_code(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_help_is_a_clap_exit() {
        let err = app().handle_signals(false).run(["burrow", "--help"]).await.unwrap_err();
        let usage = err.downcast_ref::<clap::Error>().unwrap();
        assert_eq!(usage.kind(), clap::error::ErrorKind::DisplayHelp);
        assert_eq!(exit_code(&err), 0);
    }

    #[tokio::test]
    async fn test_help_carries_description_and_notice() {
        let err = app().handle_signals(false).run(["burrow", "--help"]).await.unwrap_err();
        let help = err.downcast_ref::<clap::Error>().unwrap().render().to_string();

        assert!(help.contains("without opening inbound ports"));
        assert!(help.contains("Apache License, Version 2.0"));
    }

    #[tokio::test]
    async fn test_explicit_false_is_accepted() {
        let err = app()
            .handle_signals(false)
            .run(["burrow", "--no-autoupdate=false", "--help"])
            .await
            .unwrap_err();
        assert_eq!(exit_code(&err), 0);
    }

    #[tokio::test]
    async fn test_unknown_flag_is_a_usage_error() {
        let err = app()
            .handle_signals(false)
            .run(["burrow", "--no-such-flag"])
            .await
            .unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[tokio::test]
    async fn test_builtin_subsystems_do_not_collide() {
        let err = app()
            .handle_signals(false)
            .run(["burrow", "access", "--help"])
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<clap::Error>().is_some());
    }
}
