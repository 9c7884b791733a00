use std::collections::BTreeMap;
use std::fmt;

use clap::parser::{MatchesError, ValueSource};
use clap::{Arg, ArgAction, ArgMatches, value_parser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    Bool,
    Str,
    Int,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    Bool(bool),
    Str(String),
    Int(i64),
    List(Vec<String>),
}

impl FlagValue {
    pub fn kind(&self) -> FlagKind {
        match self {
            FlagValue::Bool(_) => FlagKind::Bool,
            FlagValue::Str(_) => FlagKind::Str,
            FlagValue::Int(_) => FlagKind::Int,
            FlagValue::List(_) => FlagKind::List,
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(b) => write!(f, "{b}"),
            FlagValue::Str(s) => f.write_str(s),
            FlagValue::Int(i) => write!(f, "{i}"),
            FlagValue::List(items) => f.write_str(&items.join(",")),
        }
    }
}

/// Where the current value of a flag came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrigin {
    CommandLine,
    Environment,
    ConfigFile,
    Default,
    Unset,
}

/// A flag contributed by a subsystem.
///
/// One-character aliases are rendered as short flags (`-p`), longer ones as
/// visible long aliases.
#[derive(Debug, Clone)]
pub struct FlagDescriptor {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: FlagKind,
    pub default: Option<FlagValue>,
    pub env: Option<&'static str>,
    pub usage: &'static str,
}

impl FlagDescriptor {
    pub fn new(name: &'static str, kind: FlagKind, usage: &'static str) -> Self {
        Self {
            name,
            aliases: &[],
            kind,
            default: None,
            env: None,
            usage,
        }
    }

    pub fn bool(name: &'static str, usage: &'static str) -> Self {
        Self::new(name, FlagKind::Bool, usage)
    }

    pub fn string(name: &'static str, usage: &'static str) -> Self {
        Self::new(name, FlagKind::Str, usage)
    }

    pub fn int(name: &'static str, usage: &'static str) -> Self {
        Self::new(name, FlagKind::Int, usage)
    }

    pub fn list(name: &'static str, usage: &'static str) -> Self {
        Self::new(name, FlagKind::List, usage)
    }

    pub fn aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn env(mut self, var: &'static str) -> Self {
        self.env = Some(var);
        self
    }

    /// Boolean flags always default to `false`; a default of another kind
    /// than the flag's is ignored.
    pub fn default_value(mut self, value: FlagValue) -> Self {
        if value.kind() == self.kind && self.kind != FlagKind::Bool {
            self.default = Some(value);
        }
        self
    }

    /// Every name this flag answers to on the command line.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.name).chain(self.aliases.iter().copied())
    }

    pub(crate) fn to_arg(&self) -> Arg {
        let mut arg = Arg::new(self.name).long(self.name).help(self.usage);

        for alias in self.aliases {
            let mut chars = alias.chars();
            match (chars.next(), chars.next()) {
                (Some(short), None) => arg = arg.short(short),
                _ => arg = arg.visible_alias(*alias),
            }
        }

        if let Some(var) = self.env {
            arg = arg.env(var);
        }

        arg = match self.kind {
            // `--flag` means true; `--flag=false` lets the user override a config file
            FlagKind::Bool => arg
                .action(ArgAction::Set)
                .value_parser(value_parser!(bool))
                .num_args(0..=1)
                .require_equals(true)
                .default_missing_value("true")
                .default_value("false"),
            FlagKind::Str => arg.action(ArgAction::Set).value_parser(value_parser!(String)),
            FlagKind::Int => arg.action(ArgAction::Set).value_parser(value_parser!(i64)),
            FlagKind::List => arg
                .action(ArgAction::Append)
                .value_parser(value_parser!(String)),
        };

        match &self.default {
            Some(FlagValue::List(items)) => arg.default_values(items.clone()),
            Some(value) => arg.default_value(value.to_string()),
            None => arg,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlagEntry {
    pub descriptor: FlagDescriptor,
    pub value: Option<FlagValue>,
    pub origin: ValueOrigin,
}

impl FlagEntry {
    /// Set by the user, on the command line or through the flag's
    /// environment variable.
    pub fn is_explicit(&self) -> bool {
        matches!(
            self.origin,
            ValueOrigin::CommandLine | ValueOrigin::Environment
        )
    }
}

/// The resolved value of every flag in scope for the selected command.
#[derive(Debug, Clone, Default)]
pub struct FlagTable {
    entries: BTreeMap<&'static str, FlagEntry>,
}

impl FlagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `descriptor` with the value and source clap parsed for it.
    pub(crate) fn read(
        &mut self,
        descriptor: &FlagDescriptor,
        matches: &ArgMatches,
    ) -> Result<(), MatchesError> {
        let name = descriptor.name;
        let value = match descriptor.kind {
            FlagKind::Bool => matches
                .try_get_one::<bool>(name)?
                .map(|b| FlagValue::Bool(*b)),
            FlagKind::Str => matches
                .try_get_one::<String>(name)?
                .map(|s| FlagValue::Str(s.clone())),
            FlagKind::Int => matches.try_get_one::<i64>(name)?.map(|i| FlagValue::Int(*i)),
            FlagKind::List => matches
                .try_get_many::<String>(name)?
                .map(|items| FlagValue::List(items.cloned().collect())),
        };

        let origin = match matches.value_source(name) {
            Some(ValueSource::CommandLine) => ValueOrigin::CommandLine,
            Some(ValueSource::EnvVariable) => ValueOrigin::Environment,
            Some(_) => ValueOrigin::Default,
            None if value.is_some() => ValueOrigin::Default,
            None => ValueOrigin::Unset,
        };

        self.insert(descriptor.clone(), value, origin);
        Ok(())
    }

    pub fn insert(&mut self, descriptor: FlagDescriptor, value: Option<FlagValue>, origin: ValueOrigin) {
        self.entries.insert(
            descriptor.name,
            FlagEntry {
                descriptor,
                value,
                origin,
            },
        );
    }

    /// Set `name` from a lower-precedence source. Returns `false` and leaves
    /// the entry untouched when the flag is unknown or was set explicitly.
    pub(crate) fn layer(&mut self, name: &str, value: FlagValue, origin: ValueOrigin) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if !entry.is_explicit() => {
                entry.value = Some(value);
                entry.origin = origin;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&FlagEntry> {
        self.entries.get(name)
    }

    pub fn is_explicit(&self, name: &str) -> bool {
        self.get(name).is_some_and(FlagEntry::is_explicit)
    }

    pub fn origin(&self, name: &str) -> ValueOrigin {
        self.get(name).map_or(ValueOrigin::Unset, |entry| entry.origin)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.get(name)?.value.as_ref()? {
            FlagValue::Str(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> bool {
        matches!(
            self.get(name).and_then(|entry| entry.value.as_ref()),
            Some(FlagValue::Bool(true))
        )
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)?.value.as_ref()? {
            FlagValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn list(&self, name: &str) -> &[String] {
        match self.get(name).and_then(|entry| entry.value.as_ref()) {
            Some(FlagValue::List(items)) => items,
            _ => &[],
        }
    }

    /// Primary name of the flag answering to `key`, which may be an alias.
    pub fn canonical_name(&self, key: &str) -> Option<&'static str> {
        if let Some((name, _)) = self.entries.get_key_value(key) {
            return Some(*name);
        }
        self.entries
            .values()
            .find(|entry| entry.descriptor.names().any(|name| name == key))
            .map(|entry| entry.descriptor.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
