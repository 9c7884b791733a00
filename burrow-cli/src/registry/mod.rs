//! Merges the flags and commands of every subsystem into one command surface.

mod command;
mod flag;

use std::collections::HashMap;
use std::sync::Arc;

use clap::ArgMatches;
use clap::parser::MatchesError;

pub use command::{Action, ActionContext, CommandDescriptor, Contributor};
pub use flag::{FlagDescriptor, FlagEntry, FlagKind, FlagTable, FlagValue, ValueOrigin};

use crate::error::RegistryError;

/// Ids clap claims for its generated `--help` / `--version`.
const RESERVED_FLAGS: &[&str] = &["help", "version"];

#[derive(Debug, Clone, Default)]
pub struct Registry {
    flags: Vec<FlagDescriptor>,
    commands: Vec<CommandDescriptor>,
}

impl Registry {
    /// Concatenate the contributions in registration order.
    ///
    /// Names are not deduplicated: a flag or command name claimed twice is
    /// rejected, since the parser cannot tell two owners of one name apart.
    pub fn collect(contributors: &[Arc<dyn Contributor>]) -> Result<Self, RegistryError> {
        let mut registry = Registry::default();
        let mut flag_owners: HashMap<&'static str, &'static str> = HashMap::new();
        let mut command_owners: HashMap<&'static str, &'static str> = HashMap::new();

        for contributor in contributors {
            let owner = contributor.name();

            for flag in contributor.flags() {
                claim_flag(&mut flag_owners, &flag, owner)?;
                registry.flags.push(flag);
            }

            for command in contributor.commands() {
                if let Some(previous) = command_owners.insert(command.name, owner) {
                    return Err(RegistryError::DuplicateCommand {
                        command: command.name.to_string(),
                        contributor: owner.to_string(),
                        previous: previous.to_string(),
                    });
                }
                registry.commands.push(command);
            }
        }

        for command in &registry.commands {
            check_scoped_flags(&flag_owners, command, command_owner(&command_owners, command))?;
        }

        Ok(registry)
    }

    pub fn flags(&self) -> &[FlagDescriptor] {
        &self.flags
    }

    pub fn commands(&self) -> &[CommandDescriptor] {
        &self.commands
    }

    pub fn find_flag(&self, name: &str) -> Option<&FlagDescriptor> {
        self.flags.iter().find(|flag| flag.name == name)
    }

    pub fn find_command(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.iter().find(|command| command.name == name)
    }

    /// Render the registry as a clap command tree.
    pub fn command(&self, name: &str, version: &str, about: &str) -> clap::Command {
        let mut cmd = clap::Command::new(name.to_string())
            .version(version.to_string())
            .about(about.to_string())
            .args(self.flags.iter().map(|flag| flag.to_arg().global(true)));

        for command in &self.commands {
            cmd = cmd.subcommand(command.to_command());
        }
        cmd
    }

    /// Walk the parsed subcommand chain, returning the selected descriptors
    /// together with the matches parsed at their level.
    pub fn select<'a>(
        &'a self,
        matches: &'a ArgMatches,
    ) -> Vec<(&'a CommandDescriptor, &'a ArgMatches)> {
        let mut path = Vec::new();
        let mut candidates = self.commands.as_slice();
        let mut current = matches;

        while let Some((name, sub_matches)) = current.subcommand() {
            let Some(descriptor) = candidates.iter().find(|c| c.name == name) else {
                break;
            };
            path.push((descriptor, sub_matches));
            candidates = descriptor.subcommands.as_slice();
            current = sub_matches;
        }

        path
    }

    /// Build the flag table for a parsed command line: global flags plus the
    /// scoped flags of every command on the selected path.
    pub fn flag_table(&self, matches: &ArgMatches) -> Result<FlagTable, MatchesError> {
        let path = self.select(matches);
        let mut table = FlagTable::new();

        // globals are propagated down to the deepest subcommand's matches
        let deepest = path.last().map_or(matches, |(_, m)| *m);
        for flag in &self.flags {
            table.read(flag, deepest)?;
        }

        for (command, command_matches) in &path {
            for flag in &command.flags {
                table.read(flag, command_matches)?;
            }
        }

        Ok(table)
    }
}

fn claim_flag(
    owners: &mut HashMap<&'static str, &'static str>,
    flag: &FlagDescriptor,
    owner: &'static str,
) -> Result<(), RegistryError> {
    for name in flag.names() {
        if RESERVED_FLAGS.contains(&name) {
            return Err(RegistryError::ReservedFlag {
                flag: name.to_string(),
                contributor: owner.to_string(),
            });
        }
        if let Some(previous) = owners.insert(name, owner) {
            return Err(RegistryError::DuplicateFlag {
                flag: name.to_string(),
                contributor: owner.to_string(),
                previous: previous.to_string(),
            });
        }
    }
    Ok(())
}

fn command_owner(owners: &HashMap<&'static str, &'static str>, command: &CommandDescriptor) -> &'static str {
    owners.get(command.name).copied().unwrap_or("unknown")
}

/// Scoped flags share one namespace with the globals and with the flags of
/// every parent command, since they all land in the same flag table.
fn check_scoped_flags(
    globals: &HashMap<&'static str, &'static str>,
    command: &CommandDescriptor,
    owner: &'static str,
) -> Result<(), RegistryError> {
    let mut scope = globals.clone();
    for flag in &command.flags {
        claim_flag(&mut scope, flag, owner)?;
    }
    for sub in &command.subcommands {
        check_scoped_flags(&scope, sub, owner)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        flags: Vec<FlagDescriptor>,
        commands: Vec<CommandDescriptor>,
    }

    impl Contributor for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn flags(&self) -> Vec<FlagDescriptor> {
            self.flags.clone()
        }

        fn commands(&self) -> Vec<CommandDescriptor> {
            self.commands.clone()
        }
    }

    fn contributor(
        name: &'static str,
        flags: Vec<FlagDescriptor>,
        commands: Vec<CommandDescriptor>,
    ) -> Arc<dyn Contributor> {
        Arc::new(Fixed {
            name,
            flags,
            commands,
        })
    }

    fn tunnel() -> Arc<dyn Contributor> {
        contributor(
            "tunnel",
            vec![
                FlagDescriptor::string("hostname", "Hostname"),
                FlagDescriptor::string("url", "Origin"),
            ],
            vec![CommandDescriptor::new("tunnel", "Run the tunnel")],
        )
    }

    fn access() -> Arc<dyn Contributor> {
        contributor(
            "access",
            vec![FlagDescriptor::bool("fedramp", "Use the fedramp endpoint")],
            vec![
                CommandDescriptor::new("access", "Access tools").subcommand(
                    CommandDescriptor::new("token", "Print a token")
                        .flag(FlagDescriptor::string("app", "Application URL"))
                        .action(Action::new(|_| async { Ok(()) })),
                ),
            ],
        )
    }

    #[test]
    fn test_disjoint_contributors_merge_without_loss() {
        let registry = Registry::collect(&[tunnel(), access()]).unwrap();

        assert_eq!(registry.flags().len(), 3);
        assert_eq!(registry.commands().len(), 2);
        let names: Vec<_> = registry.flags().iter().map(|f| f.name).collect();
        assert_eq!(names, ["hostname", "url", "fedramp"]);
        assert!(registry.find_command("access").is_some());
        assert!(registry.find_flag("url").is_some());
    }

    #[test]
    fn test_duplicate_flag_is_rejected() {
        let other = contributor("other", vec![FlagDescriptor::string("hostname", "Again")], vec![]);
        let err = Registry::collect(&[tunnel(), other]).unwrap_err();

        match err {
            RegistryError::DuplicateFlag {
                flag,
                contributor,
                previous,
            } => {
                assert_eq!(flag, "hostname");
                assert_eq!(contributor, "other");
                assert_eq!(previous, "tunnel");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_alias_collision_is_rejected() {
        let other = contributor(
            "other",
            vec![FlagDescriptor::string("host", "Host").aliases(&["hostname"])],
            vec![],
        );
        assert!(matches!(
            Registry::collect(&[tunnel(), other]),
            Err(RegistryError::DuplicateFlag { .. })
        ));
    }

    #[test]
    fn test_duplicate_command_is_rejected() {
        let other = contributor("other", vec![], vec![CommandDescriptor::new("tunnel", "Again")]);
        assert!(matches!(
            Registry::collect(&[tunnel(), other]),
            Err(RegistryError::DuplicateCommand { .. })
        ));
    }

    #[test]
    fn test_scoped_flag_shadowing_global_is_rejected() {
        let other = contributor(
            "other",
            vec![],
            vec![CommandDescriptor::new("probe", "Probe").flag(FlagDescriptor::string("url", "Again"))],
        );
        assert!(matches!(
            Registry::collect(&[tunnel(), other]),
            Err(RegistryError::DuplicateFlag { .. })
        ));
    }

    #[test]
    fn test_reserved_flag_is_rejected() {
        let other = contributor("other", vec![FlagDescriptor::bool("version", "Version")], vec![]);
        assert!(matches!(
            Registry::collect(&[other]),
            Err(RegistryError::ReservedFlag { .. })
        ));
    }

    #[test]
    fn test_select_and_flag_table_for_nested_command() {
        let registry = Registry::collect(&[tunnel(), access()]).unwrap();
        let matches = registry
            .command("burrow", "0.1.0", "test")
            .try_get_matches_from(["burrow", "access", "token", "--app", "https://app.example.com", "--hostname", "h"])
            .unwrap();

        let path: Vec<_> = registry.select(&matches).into_iter().map(|(c, _)| c.name).collect();
        assert_eq!(path, ["access", "token"]);

        let table = registry.flag_table(&matches).unwrap();
        assert_eq!(table.string("app"), Some("https://app.example.com"));
        assert_eq!(table.string("hostname"), Some("h"));
        assert!(table.is_explicit("hostname"));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_global_flag_before_subcommand() {
        let registry = Registry::collect(&[tunnel()]).unwrap();
        let matches = registry
            .command("burrow", "0.1.0", "test")
            .try_get_matches_from(["burrow", "--hostname", "foo", "tunnel"])
            .unwrap();

        let table = registry.flag_table(&matches).unwrap();
        assert_eq!(table.string("hostname"), Some("foo"));
        assert!(table.is_explicit("hostname"));
    }

    #[test]
    fn test_namespace_command_requires_subcommand() {
        let registry = Registry::collect(&[access()]).unwrap();
        let result = registry
            .command("burrow", "0.1.0", "test")
            .try_get_matches_from(["burrow", "access"]);
        assert!(result.is_err());
    }
}
