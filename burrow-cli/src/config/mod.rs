//! Optional YAML configuration file layered beneath explicitly-set flags.
//!
//! Precedence is command line > environment > configuration file > built-in
//! default. Keys of the file are flag names; keys that do not name a flag in
//! scope are ignored, so one file can serve several commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigLoadCause};
use crate::registry::{FlagDescriptor, FlagKind, FlagTable, FlagValue, ValueOrigin};

/// Name of the flag that points at the configuration file.
pub const CONFIG_FLAG: &str = "config";

const CONFIG_FILE_NAMES: &[&str] = &["config.yml", "config.yaml"];

pub fn config_flag() -> FlagDescriptor {
    FlagDescriptor::string(
        CONFIG_FLAG,
        "Path to a YAML configuration file; by default the first config.yml found in ~/.burrow, the user config dir, /etc/burrow or /usr/local/etc/burrow",
    )
    .env("BURROW_CONFIG")
}

/// Directories searched for a configuration file when none was named.
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".burrow"));
    }
    if let Some(config) = dirs::config_dir() {
        dirs.push(config.join("burrow"));
    }
    dirs.push(PathBuf::from("/etc/burrow"));
    dirs.push(PathBuf::from("/usr/local/etc/burrow"));
    dirs
}

/// Flag name to raw value, as read from one file.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    values: BTreeMap<String, Value>,
}

impl ConfigSource {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let load_err = |cause: ConfigLoadCause| ConfigError::Load {
            path: path.to_path_buf(),
            cause,
        };

        let contents = std::fs::read_to_string(path).map_err(|e| load_err(e.into()))?;
        let document: Value = serde_yaml::from_str(&contents).map_err(|e| load_err(e.into()))?;

        let mapping = match document {
            // an empty file parses as null
            Value::Null => return Ok(Self::from_values(path, BTreeMap::new())),
            Value::Mapping(mapping) => mapping,
            _ => return Err(load_err(ConfigLoadCause::NotAMapping)),
        };

        let mut values = BTreeMap::new();
        for (key, value) in mapping {
            match key {
                Value::String(key) => {
                    values.insert(key, value);
                }
                other => {
                    let key = serde_yaml::to_string(&other).unwrap_or_default();
                    return Err(load_err(ConfigLoadCause::InvalidKey(key.trim().to_string())));
                }
            }
        }

        Ok(Self::from_values(path, values))
    }

    pub fn from_values(path: &Path, values: BTreeMap<String, Value>) -> Self {
        Self {
            path: path.to_path_buf(),
            values,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigResolver {
    search_dirs: Vec<PathBuf>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(default_search_dirs())
    }
}

impl ConfigResolver {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    /// The file the `config` flag names, else the first conventional file
    /// that exists.
    pub fn candidate_path(&self, flags: &FlagTable) -> Option<PathBuf> {
        if let Some(path) = flags.string(CONFIG_FLAG) {
            return Some(PathBuf::from(path));
        }

        self.search_dirs
            .iter()
            .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
            .find(|path| path.is_file())
    }

    /// Load the configuration source, if there is one.
    ///
    /// A missing file is not an error: configuration is optional.
    pub fn resolve(&self, flags: &FlagTable) -> Result<Option<ConfigSource>, ConfigError> {
        let Some(path) = self.candidate_path(flags) else {
            debug!("No configuration file found");
            return Ok(None);
        };

        if !path.exists() {
            if flags.is_explicit(CONFIG_FLAG) {
                warn!("Configuration file {} does not exist, ignoring", path.display());
            }
            return Ok(None);
        }

        ConfigSource::load(&path).map(Some)
    }
}

/// Layer `source` beneath the explicitly-set flags of `flags`.
///
/// Returns the number of flags whose value now comes from the file.
pub fn apply(source: &ConfigSource, flags: &mut FlagTable) -> Result<usize, ConfigError> {
    let mut applied = 0;

    for (key, raw) in &source.values {
        // keys may use any of a flag's names
        let Some(name) = flags.canonical_name(key) else {
            debug!("Ignoring configuration key {key}: no such flag");
            continue;
        };
        if name != key && source.values.contains_key(name) {
            debug!("Ignoring configuration key {key}: {name} is set as well");
            continue;
        }
        let Some(entry) = flags.get(name) else {
            continue;
        };
        if entry.is_explicit() {
            debug!("Keeping explicitly set --{name} over configuration file");
            continue;
        }

        let value = convert(entry.descriptor.kind, raw).map_err(|reason| ConfigError::Apply {
            path: source.path.clone(),
            flag: name.to_string(),
            reason,
        })?;

        if flags.layer(name, value, ValueOrigin::ConfigFile) {
            applied += 1;
        }
    }

    Ok(applied)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn convert(kind: FlagKind, value: &Value) -> Result<FlagValue, String> {
    match kind {
        FlagKind::Bool => match value {
            Value::Bool(b) => Ok(FlagValue::Bool(*b)),
            Value::String(s) => s
                .parse()
                .map(FlagValue::Bool)
                .map_err(|_| format!("expects a boolean, got {s:?}")),
            _ => Err("expects a boolean".to_string()),
        },
        FlagKind::Str => scalar_to_string(value)
            .map(FlagValue::Str)
            .ok_or_else(|| "expects a string".to_string()),
        FlagKind::Int => match value {
            Value::Number(n) => n
                .as_i64()
                .map(FlagValue::Int)
                .ok_or_else(|| format!("expects an integer, got {n}")),
            Value::String(s) => s
                .trim()
                .parse()
                .map(FlagValue::Int)
                .map_err(|_| format!("expects an integer, got {s:?}")),
            _ => Err("expects an integer".to_string()),
        },
        FlagKind::List => match value {
            Value::Sequence(items) => items
                .iter()
                .map(|item| scalar_to_string(item).ok_or_else(|| "expects a list of scalars".to_string()))
                .collect::<Result<Vec<_>, _>>()
                .map(FlagValue::List),
            scalar => scalar_to_string(scalar)
                .map(|s| FlagValue::List(vec![s]))
                .ok_or_else(|| "expects a list".to_string()),
        },
    }
}
