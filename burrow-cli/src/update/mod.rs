//! Updater subsystem: the `update` command and the periodic self-update
//! that runs alongside the tunnel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::StatusError;
use crate::registry::{
    Action, ActionContext, CommandDescriptor, Contributor, FlagDescriptor, FlagTable, FlagValue,
};
use crate::util::shutdown::ShutdownHandles;

pub const NO_AUTOUPDATE_FLAG: &str = "no-autoupdate";
pub const AUTOUPDATE_FREQ_FLAG: &str = "autoupdate-freq";

const DEFAULT_AUTOUPDATE_FREQ_SECS: i64 = 24 * 60 * 60;
const MIN_AUTOUPDATE_FREQ_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Updated { from: String, to: String },
}

/// Where new releases come from and how they get installed.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn check_and_apply(&self, current_version: &str) -> Result<UpdateOutcome>;
}

/// Release binaries published on GitHub.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    pub repo_owner: String,
    pub repo_name: String,
    pub bin_name: String,
}

impl Default for GithubReleases {
    fn default() -> Self {
        Self {
            repo_owner: "burrow-agent".to_string(),
            repo_name: "burrow".to_string(),
            bin_name: "burrow".to_string(),
        }
    }
}

#[async_trait]
impl UpdateSource for GithubReleases {
    async fn check_and_apply(&self, current_version: &str) -> Result<UpdateOutcome> {
        let source = self.clone();
        let current = current_version.to_string();

        // self_update downloads with a blocking client
        tokio::task::spawn_blocking(move || -> Result<UpdateOutcome> {
            let status = self_update::backends::github::Update::configure()
                .repo_owner(&source.repo_owner)
                .repo_name(&source.repo_name)
                .bin_name(&source.bin_name)
                .current_version(&current)
                .no_confirm(true)
                .show_output(false)
                .build()
                .context("Failed to configure updater")?
                .update()
                .context("Failed to check for updates")?;

            let new_version = status.version();
            if new_version != current {
                Ok(UpdateOutcome::Updated {
                    from: current.clone(),
                    to: new_version.to_string(),
                })
            } else {
                Ok(UpdateOutcome::UpToDate)
            }
        })
        .await
        .context("Update task failed")?
    }
}

/// Contributes the `update` command and the auto-update flags.
#[derive(Clone)]
pub struct UpdateSubsystem {
    source: Arc<dyn UpdateSource>,
}

impl UpdateSubsystem {
    pub fn new(source: Arc<dyn UpdateSource>) -> Self {
        Self { source }
    }
}

impl Contributor for UpdateSubsystem {
    fn name(&self) -> &'static str {
        "updater"
    }

    fn flags(&self) -> Vec<FlagDescriptor> {
        vec![
            FlagDescriptor::bool(
                NO_AUTOUPDATE_FLAG,
                "Disable periodic check for updates, restarting the agent with the new version",
            )
            .env("NO_AUTOUPDATE"),
            FlagDescriptor::int(AUTOUPDATE_FREQ_FLAG, "Autoupdate frequency in seconds")
                .default_value(FlagValue::Int(DEFAULT_AUTOUPDATE_FREQ_SECS)),
        ]
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        let source = self.source.clone();
        vec![
            CommandDescriptor::new("update", "Update the agent if a new version exists")
                .description(
                    "Looks for a new version on the official download server.\n\
                     If a new version exists, updates the agent binary and quits.\n\
                     Otherwise, does nothing.\n\n\
                     To determine if an update happened in a script, check for error code 64.",
                )
                .action(Action::new(move |ctx| update(source.clone(), ctx))),
        ]
    }
}

/// `burrow update`
pub async fn update(source: Arc<dyn UpdateSource>, ctx: ActionContext) -> Result<()> {
    info!("Checking for updates...");
    match source.check_and_apply(&ctx.version).await? {
        UpdateOutcome::UpToDate => {
            info!("You are running the latest version ({})", ctx.version);
            Ok(())
        }
        UpdateOutcome::Updated { from, to } => {
            info!("Updated from {} → {}", from, to);
            Err(StatusError::update_applied(&from, &to).into())
        }
    }
}

/// How often the auto-updater should run, or `None` when it is disabled.
pub fn autoupdate_interval(flags: &FlagTable) -> Option<Duration> {
    if flags.bool(NO_AUTOUPDATE_FLAG) {
        return None;
    }
    let secs = flags
        .int(AUTOUPDATE_FREQ_FLAG)
        .unwrap_or(DEFAULT_AUTOUPDATE_FREQ_SECS);
    if secs <= 0 {
        return None;
    }
    Some(Duration::from_secs((secs as u64).max(MIN_AUTOUPDATE_FREQ_SECS)))
}

/// Check for updates every `interval` until shutdown.
///
/// Returns the exit-64 status once an update was installed so the host
/// service manager restarts the agent on the new binary. A failed check is
/// logged and retried at the next tick.
pub async fn auto_update_loop(
    source: Arc<dyn UpdateSource>,
    version: &str,
    interval: Duration,
    shutdown: ShutdownHandles,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.stopping() => {
                debug!("Auto-updater stopping");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }

        // an in-flight check is only abandoned on forced shutdown
        let outcome = tokio::select! {
            _ = shutdown.forced.closed() => return Ok(()),
            outcome = source.check_and_apply(version) => outcome,
        };

        match outcome {
            Ok(UpdateOutcome::UpToDate) => debug!("No update available"),
            Ok(UpdateOutcome::Updated { from, to }) => {
                info!("Updated from {} → {}, exiting for restart", from, to);
                return Err(StatusError::update_applied(&from, &to).into());
            }
            Err(e) => warn!("Update check failed: {:?}", e),
        }
    }
}
