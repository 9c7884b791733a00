use std::path::PathBuf;

use burrow_shared::exit;
use thiserror::Error;

/// Raised while merging subsystem contributions into one command surface.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("flag --{flag} from {contributor} collides with a flag registered by {previous}")]
    DuplicateFlag {
        flag: String,
        contributor: String,
        previous: String,
    },

    #[error("command `{command}` from {contributor} collides with a command registered by {previous}")]
    DuplicateCommand {
        command: String,
        contributor: String,
        previous: String,
    },

    #[error("flag --{flag} from {contributor} uses a name reserved by the command line parser")]
    ReservedFlag { flag: String, contributor: String },
}

/// Why a configuration file could not be turned into a mapping.
#[derive(Debug, Error)]
pub enum ConfigLoadCause {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("top-level document must be a mapping of flag names to values")]
    NotAMapping,

    #[error("key {0} is not a string")]
    InvalidKey(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load configuration from {}: {cause}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        cause: ConfigLoadCause,
    },

    #[error("cannot apply configuration from {}: flag `{flag}` {reason}", path.display())]
    Apply {
        path: PathBuf,
        flag: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Load { path, .. } | ConfigError::Apply { path, .. } => path,
        }
    }
}

/// The primary action panicked; carries the panic payload when it was a string.
#[derive(Debug, Error)]
#[error("action panicked: {0}")]
pub struct ActionPanic(pub String);

/// An action's request to end the process with a specific exit code.
///
/// Not a fault: the supervisor does not forward it to diagnostics.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StatusError {
    pub code: u8,
    pub message: String,
}

impl StatusError {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn update_applied(from: &str, to: &str) -> Self {
        Self::new(
            exit::UPDATE_APPLIED,
            format!("updated from {from} to {to}; restart to run the new version"),
        )
    }
}

/// Map the terminal error of a run onto the process exit code.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(status) = err.downcast_ref::<StatusError>() {
        return status.code;
    }
    if let Some(usage) = err.downcast_ref::<clap::Error>() {
        return u8::try_from(usage.exit_code()).unwrap_or(exit::FAILURE);
    }
    exit::FAILURE
}
