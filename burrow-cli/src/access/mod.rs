//! Access subsystem: read-side helpers for applications behind access control.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use reqwest::Url;
use thiserror::Error;
use tracing::debug;

use crate::registry::{Action, ActionContext, CommandDescriptor, Contributor, FlagDescriptor};

pub const APP_FLAG: &str = "app";

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("--app is required")]
    MissingApp,

    #[error("invalid application URL {0:?}")]
    InvalidApp(String),

    #[error("no token stored for {app}, run a login first (looked in {})", path.display())]
    NoToken { app: String, path: PathBuf },
}

#[derive(Debug, Clone, Default)]
pub struct AccessSubsystem {
    token_dir: Option<PathBuf>,
}

impl AccessSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look tokens up in `dir` instead of `~/.burrow/tokens`.
    pub fn with_token_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.token_dir = Some(dir.into());
        self
    }

    fn token_dir(&self) -> Result<PathBuf> {
        match &self.token_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".burrow")
                .join("tokens")),
        }
    }

    /// `burrow access token --app <url>`
    pub async fn token(&self, ctx: ActionContext) -> Result<()> {
        let app = ctx.flags.string(APP_FLAG).ok_or(AccessError::MissingApp)?;
        let token = read_token(&self.token_dir()?, app)?;
        println!("{token}");
        Ok(())
    }
}

impl Contributor for AccessSubsystem {
    fn name(&self) -> &'static str {
        "access"
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        let access = self.clone();
        let token = CommandDescriptor::new("token", "Print the access token of an application")
            .flag(FlagDescriptor::string(APP_FLAG, "URL of the application"))
            .action(Action::new(move |ctx| {
                let access = access.clone();
                async move { access.token(ctx).await }
            }));

        vec![
            CommandDescriptor::new("access", "Access protected applications")
                .description("Helpers for applications protected by edge access control.")
                .subcommand(token),
        ]
    }
}

/// Path of the stored token for `app` inside `dir`: one file per host.
pub fn token_path(dir: &Path, app: &str) -> Result<PathBuf, AccessError> {
    let url = Url::parse(app).map_err(|_| AccessError::InvalidApp(app.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| AccessError::InvalidApp(app.to_string()))?;
    Ok(dir.join(format!("{host}-token")))
}

pub fn read_token(dir: &Path, app: &str) -> Result<String> {
    let path = token_path(dir, app)?;
    debug!("Reading token from {}", path.display());

    let token = match std::fs::read_to_string(&path) {
        Ok(contents) => contents.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read token {}", path.display()));
        }
    };

    if token.is_empty() {
        return Err(AccessError::NoToken {
            app: app.to_string(),
            path,
        }
        .into());
    }
    Ok(token)
}
