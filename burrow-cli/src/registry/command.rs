use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use clap::Command;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::registry::flag::{FlagDescriptor, FlagTable};
use crate::util::shutdown::ShutdownHandles;

/// Everything an action gets to see of the process.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub flags: Arc<FlagTable>,
    pub version: Arc<str>,
    /// Names of the selected command and its parents, outermost first.
    /// Empty when the default action runs.
    pub command: Vec<String>,
    pub shutdown: ShutdownHandles,
}

/// Entry point of a command, shared between the registry and the dispatcher.
#[derive(Clone)]
pub struct Action(Arc<dyn Fn(ActionContext) -> BoxFuture<'static, Result<()>> + Send + Sync>);

impl Action {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self(Arc::new(move |ctx| f(ctx).boxed()))
    }

    pub fn call(&self, ctx: ActionContext) -> BoxFuture<'static, Result<()>> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Action")
    }
}

#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    pub name: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
    pub action: Option<Action>,
    /// Flags accepted only by this command.
    pub flags: Vec<FlagDescriptor>,
    pub subcommands: Vec<CommandDescriptor>,
}

impl CommandDescriptor {
    pub fn new(name: &'static str, usage: &'static str) -> Self {
        Self {
            name,
            usage,
            description: "",
            action: None,
            flags: Vec::new(),
            subcommands: Vec::new(),
        }
    }

    pub fn description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn flag(mut self, flag: FlagDescriptor) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn subcommand(mut self, command: CommandDescriptor) -> Self {
        self.subcommands.push(command);
        self
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(self.name)
            .about(self.usage)
            .args(self.flags.iter().map(FlagDescriptor::to_arg));

        if !self.description.is_empty() {
            cmd = cmd.long_about(self.description);
        }

        for sub in &self.subcommands {
            cmd = cmd.subcommand(sub.to_command());
        }

        // a command without its own action is only a namespace
        if self.action.is_none() && !self.subcommands.is_empty() {
            cmd = cmd.subcommand_required(true).arg_required_else_help(true);
        }

        cmd
    }
}

/// A subsystem's contribution to the command surface.
pub trait Contributor: Send + Sync {
    /// Name used in collision reports.
    fn name(&self) -> &'static str;

    /// Global flags, accepted before or after any command.
    fn flags(&self) -> Vec<FlagDescriptor> {
        Vec::new()
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        Vec::new()
    }
}
