//! The dispatcher: one run of the process from argument parsing to the
//! action's final result.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::config::{self, ConfigResolver, config_flag};
use crate::diagnostics::{DiagnosticsSink, FaultReporter, NoopSink, Tags};
use crate::host::{spawn_grace_timer, spawn_signal_listener};
use crate::registry::{
    Action, ActionContext, Contributor, FlagDescriptor, FlagValue, Registry, ValueOrigin,
};
use crate::util::logging::{init_logging, set_log_level};
use crate::util::shutdown::ShutdownController;

pub const LOGLEVEL_FLAG: &str = "loglevel";
pub const GRACE_PERIOD_FLAG: &str = "grace-period";

const DEFAULT_GRACE_PERIOD_SECS: i64 = 30;
const HOSTNAME_TAG: &str = "hostname";

/// Flags owned by the dispatcher itself.
struct CoreFlags;

impl Contributor for CoreFlags {
    fn name(&self) -> &'static str {
        "core"
    }

    fn flags(&self) -> Vec<FlagDescriptor> {
        vec![
            config_flag(),
            FlagDescriptor::string(
                LOGLEVEL_FLAG,
                "Application logging level (trace, debug, info, warn, error)",
            )
            .default_value(FlagValue::Str("info".to_string()))
            .env("TUNNEL_LOGLEVEL"),
            FlagDescriptor::int(
                GRACE_PERIOD_FLAG,
                "Seconds to wait for running work to finish after a stop request before forcing shutdown",
            )
            .default_value(FlagValue::Int(DEFAULT_GRACE_PERIOD_SECS))
            .env("TUNNEL_GRACE_PERIOD"),
        ]
    }
}

pub struct App {
    name: &'static str,
    version: String,
    long_version: Option<String>,
    about: String,
    long_about: Option<String>,
    after_help: Option<String>,
    contributors: Vec<Arc<dyn Contributor>>,
    default_action: Option<Action>,
    sink: Arc<dyn DiagnosticsSink>,
    config: ConfigResolver,
    handle_signals: bool,
    controller: ShutdownController,
}

impl App {
    pub fn new(name: &'static str, version: impl Into<String>) -> Self {
        Self {
            name,
            version: version.into(),
            long_version: None,
            about: String::new(),
            long_about: None,
            after_help: None,
            contributors: Vec::new(),
            default_action: None,
            sink: Arc::new(NoopSink),
            config: ConfigResolver::default(),
            handle_signals: true,
            controller: ShutdownController::new(),
        }
    }

    pub fn about(mut self, about: impl Into<String>) -> Self {
        self.about = about.into();
        self
    }

    /// Description shown by `--help`.
    pub fn long_about(mut self, long_about: impl Into<String>) -> Self {
        self.long_about = Some(long_about.into());
        self
    }

    /// Text printed after the help, e.g. a copyright notice.
    pub fn after_help(mut self, after_help: impl Into<String>) -> Self {
        self.after_help = Some(after_help.into());
        self
    }

    /// Shown by `--version`; the plain version is still what actions see.
    pub fn long_version(mut self, long_version: impl Into<String>) -> Self {
        self.long_version = Some(long_version.into());
        self
    }

    /// Register a subsystem. Registration order is the order of `--help`.
    pub fn contributor(mut self, contributor: Arc<dyn Contributor>) -> Self {
        self.contributors.push(contributor);
        self
    }

    /// Action run when no command is given. Without one a command is required.
    pub fn default_action(mut self, action: Action) -> Self {
        self.default_action = Some(action);
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.config = ConfigResolver::new(dirs);
        self
    }

    /// Whether SIGINT/SIGTERM are turned into shutdown requests.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Closing side of the shutdown signals, for embedders that stop the
    /// process by other means than signals.
    pub fn controller(&self) -> ShutdownController {
        self.controller.clone()
    }

    pub async fn run<I, T>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut contributors: Vec<Arc<dyn Contributor>> = vec![Arc::new(CoreFlags)];
        contributors.extend(self.contributors.iter().cloned());
        let registry = Registry::collect(&contributors)?;

        let mut command = registry.command(self.name, &self.version, &self.about);
        if let Some(long_version) = &self.long_version {
            command = command.long_version(long_version.clone());
        }
        if let Some(long_about) = &self.long_about {
            command = command.long_about(long_about.clone());
        }
        if let Some(after_help) = &self.after_help {
            command = command.after_help(after_help.clone());
        }
        if self.default_action.is_none() {
            command = command.subcommand_required(true).arg_required_else_help(true);
        }
        let matches = command.try_get_matches_from(args)?;

        let selected = registry.select(&matches);
        let command_path: Vec<String> = selected.iter().map(|(c, _)| c.name.to_string()).collect();
        let action = match selected.last() {
            Some((command, _)) => command.action.clone(),
            None => self.default_action.clone(),
        }
        .ok_or_else(|| anyhow!("command `{}` has nothing to run", command_path.join(" ")))?;

        let mut flags = registry
            .flag_table(&matches)
            .context("Failed to read command line flags")?;

        // the resolver reports through the log, so it has to be up first
        init_logging(flags.string(LOGLEVEL_FLAG).unwrap_or("info"));
        let source = self.config.resolve(&flags)?;
        let applied = match &source {
            Some(source) => config::apply(source, &mut flags)?,
            None => 0,
        };
        if flags.origin(LOGLEVEL_FLAG) == ValueOrigin::ConfigFile {
            set_log_level(flags.string(LOGLEVEL_FLAG).unwrap_or("info"));
        }
        if let Some(source) = &source {
            info!("Applied configuration from {}", source.path().display());
            debug!("{} of {} configuration keys in use", applied, source.len());
        }

        let grace = Duration::from_secs(
            flags
                .int(GRACE_PERIOD_FLAG)
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECS)
                .max(0) as u64,
        );
        let mut host_tasks = vec![spawn_grace_timer(self.controller.clone(), grace)];
        if self.handle_signals {
            host_tasks.push(spawn_signal_listener(self.controller.clone())?);
        }

        let mut tags = Tags::new();
        let hostname = flags
            .string(HOSTNAME_TAG)
            .map(str::to_string)
            .or_else(System::host_name);
        if let Some(hostname) = hostname {
            tags.insert(HOSTNAME_TAG.to_string(), hostname);
        }
        let command_tag = if command_path.is_empty() {
            "default".to_string()
        } else {
            command_path.join(" ")
        };
        tags.insert("command".to_string(), command_tag);

        let handles = self.controller.handles();
        let ctx = ActionContext {
            flags: Arc::new(flags),
            version: Arc::from(self.version.as_str()),
            command: command_path,
            shutdown: handles.clone(),
        };

        let reporter = FaultReporter::new(self.sink.clone(), self.version.clone());
        let supervised = reporter.supervise(tags, action.call(ctx));
        tokio::pin!(supervised);

        let outcome = tokio::select! {
            result = &mut supervised => Some(result),
            _ = handles.forced.closed() => None,
            _ = handles.graceful.closed() => {
                info!("Graceful shutdown requested, waiting for running work to finish");
                tokio::select! {
                    result = &mut supervised => Some(result),
                    _ = handles.forced.closed() => None,
                }
            }
        };

        let result = match outcome {
            Some(result) => result,
            None => {
                warn!("Forced shutdown, abandoning running work");
                Ok(())
            }
        };

        self.controller.close_graceful();
        for task in host_tasks {
            task.abort();
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessSubsystem;
    use crate::diagnostics::tests::RecordingSink;
    use crate::error::{RegistryError, exit_code};
    use crate::registry::{CommandDescriptor, FlagTable, ValueOrigin};
    use crate::update::UpdateSubsystem;
    use crate::update::tests::FakeSource;
    use burrow_shared::diagnostics::FaultKind;
    use burrow_shared::exit;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use thiserror::Error;
    use tokio::time::timeout;

    #[derive(Debug, Error)]
    #[error("origin refused connection")]
    struct OriginError;

    struct Hostnames;

    impl Contributor for Hostnames {
        fn name(&self) -> &'static str {
            "hostnames"
        }

        fn flags(&self) -> Vec<FlagDescriptor> {
            vec![FlagDescriptor::string("hostname", "Hostname to serve")]
        }
    }

    /// Default action that remembers the flags it ran with.
    fn capturing_action() -> (Action, Arc<Mutex<Option<Arc<FlagTable>>>>) {
        let seen = Arc::new(Mutex::new(None));
        let action = Action::new({
            let seen = seen.clone();
            move |ctx: ActionContext| {
                let seen = seen.clone();
                async move {
                    *seen.lock().unwrap() = Some(ctx.flags.clone());
                    Ok(())
                }
            }
        });
        (action, seen)
    }

    fn app(config_dir: &TempDir) -> App {
        App::new("burrow", "0.1.0")
            .contributor(Arc::new(Hostnames))
            .config_search_dirs(vec![config_dir.path().to_path_buf()])
            .handle_signals(false)
    }

    #[tokio::test]
    async fn test_explicit_hostname_without_config() {
        let dir = TempDir::new().unwrap();
        let (action, seen) = capturing_action();

        app(&dir)
            .default_action(action)
            .run(["burrow", "--hostname=foo"])
            .await
            .unwrap();

        let flags = seen.lock().unwrap().clone().expect("action should run");
        assert_eq!(flags.string("hostname"), Some("foo"));
        assert_eq!(flags.origin("hostname"), ValueOrigin::CommandLine);
        assert_eq!(flags.string(LOGLEVEL_FLAG), Some("info"));
        assert_eq!(flags.origin(LOGLEVEL_FLAG), ValueOrigin::Default);
    }

    #[tokio::test]
    async fn test_config_supplies_unset_hostname() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.yml"), "hostname: bar\ngrace-period: 5\n").unwrap();
        let (action, seen) = capturing_action();

        app(&dir).default_action(action).run(["burrow"]).await.unwrap();

        let flags = seen.lock().unwrap().clone().unwrap();
        assert_eq!(flags.string("hostname"), Some("bar"));
        assert_eq!(flags.origin("hostname"), ValueOrigin::ConfigFile);
        assert_eq!(flags.int(GRACE_PERIOD_FLAG), Some(5));
    }

    #[tokio::test]
    async fn test_explicit_flag_beats_config() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.yml"), "hostname: bar\n").unwrap();
        let (action, seen) = capturing_action();

        app(&dir)
            .default_action(action)
            .run(["burrow", "--hostname", "foo"])
            .await
            .unwrap();

        let flags = seen.lock().unwrap().clone().unwrap();
        assert_eq!(flags.string("hostname"), Some("foo"));
        assert_eq!(flags.origin("hostname"), ValueOrigin::CommandLine);
    }

    #[tokio::test]
    async fn test_explicit_config_path() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let path = other.path().join("edge.yaml");
        std::fs::write(&path, "hostname: from-explicit\n").unwrap();
        let (action, seen) = capturing_action();

        app(&dir)
            .default_action(action)
            .run(["burrow".into(), "--config".into(), path.into_os_string()])
            .await
            .unwrap();

        let flags = seen.lock().unwrap().clone().unwrap();
        assert_eq!(flags.string("hostname"), Some("from-explicit"));
    }

    #[tokio::test]
    async fn test_explicit_false_beats_config_true() {
        use crate::update::NO_AUTOUPDATE_FLAG;

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.yml"), "no-autoupdate: true\n").unwrap();
        let updater = || Arc::new(UpdateSubsystem::new(Arc::new(FakeSource::new(vec![]))));

        let (action, seen) = capturing_action();
        app(&dir)
            .contributor(updater())
            .default_action(action)
            .run(["burrow", "--no-autoupdate=false"])
            .await
            .unwrap();
        let flags = seen.lock().unwrap().clone().unwrap();
        assert!(!flags.bool(NO_AUTOUPDATE_FLAG));
        assert_eq!(flags.origin(NO_AUTOUPDATE_FLAG), ValueOrigin::CommandLine);

        let (action, seen) = capturing_action();
        app(&dir)
            .contributor(updater())
            .default_action(action)
            .run(["burrow"])
            .await
            .unwrap();
        let flags = seen.lock().unwrap().clone().unwrap();
        assert!(flags.bool(NO_AUTOUPDATE_FLAG));
        assert_eq!(flags.origin(NO_AUTOUPDATE_FLAG), ValueOrigin::ConfigFile);
    }

    struct Regions;

    const REGION_ENV_VAR: &str = "BURROW_LIFECYCLE_TEST_REGION";

    impl Contributor for Regions {
        fn name(&self) -> &'static str {
            "regions"
        }

        fn flags(&self) -> Vec<FlagDescriptor> {
            vec![FlagDescriptor::string("region", "Edge region").env(REGION_ENV_VAR)]
        }
    }

    #[tokio::test]
    async fn test_environment_beats_config() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.yml"), "region: us-east\n").unwrap();
        let (action, seen) = capturing_action();

        // SAFETY: this variable is only touched by this test
        unsafe { std::env::set_var(REGION_ENV_VAR, "eu-west") };
        let result = app(&dir)
            .contributor(Arc::new(Regions))
            .default_action(action)
            .run(["burrow"])
            .await;
        unsafe { std::env::remove_var(REGION_ENV_VAR) };
        result.unwrap();

        let flags = seen.lock().unwrap().clone().unwrap();
        assert_eq!(flags.string("region"), Some("eu-west"));
        assert_eq!(flags.origin("region"), ValueOrigin::Environment);
        assert!(flags.is_explicit("region"));
    }

    /// Log output collected in memory.
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_missing_explicit_config_is_logged() {
        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let log = log.clone();
                move || log.clone()
            })
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.yml");
        let (action, seen) = capturing_action();

        app(&dir)
            .default_action(action)
            .run(["burrow".into(), "--config".into(), missing.clone().into_os_string()])
            .await
            .unwrap();

        assert!(seen.lock().unwrap().is_some());
        let output = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("does not exist"));
        assert!(output.contains(&missing.display().to_string()));
    }

    #[tokio::test]
    async fn test_malformed_config_stops_before_action() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "hostname: [unclosed\n").unwrap();
        let invoked = Arc::new(AtomicBool::new(false));
        let action = Action::new({
            let invoked = invoked.clone();
            move |_ctx| {
                let invoked = invoked.clone();
                async move {
                    invoked.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        let err = app(&dir)
            .default_action(action)
            .run(["burrow"])
            .await
            .unwrap_err();

        assert!(!invoked.load(Ordering::SeqCst));
        assert!(format!("{err:#}").contains(&path.display().to_string()));
        assert_eq!(exit_code(&err), exit::FAILURE);
    }

    #[tokio::test]
    async fn test_action_error_is_reported_and_returned() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());

        let err = app(&dir)
            .diagnostics(sink.clone())
            .default_action(Action::new(|_ctx| async { Err(anyhow::Error::new(OriginError)) }))
            .run(["burrow", "--hostname=foo"])
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<OriginError>().is_some());
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, FaultKind::Error);
        assert_eq!(reports[0].tag("hostname"), Some("foo"));
        assert_eq!(reports[0].tag("command"), Some("default"));
    }

    #[tokio::test]
    async fn test_update_applied_exits_64() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());

        let err = app(&dir)
            .diagnostics(sink.clone())
            .contributor(Arc::new(UpdateSubsystem::new(Arc::new(FakeSource::newer("0.2.0")))))
            .run(["burrow", "update"])
            .await
            .unwrap_err();

        assert_eq!(exit_code(&err), exit::UPDATE_APPLIED);
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_forced_shutdown_abandons_action() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).default_action(Action::new(|_ctx| async {
            futures::future::pending::<()>().await;
            Ok(())
        }));

        let controller = app.controller();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            controller.close_forced();
        });

        let result = timeout(Duration::from_secs(2), app.run(["burrow"])).await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_for_action() {
        let dir = TempDir::new().unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let app = app(&dir).default_action(Action::new({
            let finished = finished.clone();
            move |ctx: ActionContext| {
                let finished = finished.clone();
                async move {
                    ctx.shutdown.graceful.closed().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        }));

        let controller = app.controller();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            controller.close_graceful();
        });

        let result = timeout(Duration::from_secs(2), app.run(["burrow"])).await.unwrap();
        assert!(result.is_ok());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_grace_period_forces_stuck_action() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).default_action(Action::new(|_ctx| async {
            futures::future::pending::<()>().await;
            Ok(())
        }));

        let controller = app.controller();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            controller.close_graceful();
        });

        let result = timeout(Duration::from_secs(2), app.run(["burrow", "--grace-period=0"]))
            .await
            .unwrap();
        assert!(result.is_ok());
        assert!(app.controller().handles().forced.is_closed());
    }

    #[tokio::test]
    async fn test_normal_completion_closes_graceful() {
        let dir = TempDir::new().unwrap();
        let (action, _) = capturing_action();
        let app = app(&dir).default_action(action);

        app.run(["burrow"]).await.unwrap();

        let handles = app.controller().handles();
        assert!(handles.graceful.is_closed());
        assert!(!handles.forced.is_closed());
    }

    #[tokio::test]
    async fn test_colliding_contributors_fail_startup() {
        let dir = TempDir::new().unwrap();
        let (action, seen) = capturing_action();

        let err = app(&dir)
            .contributor(Arc::new(Hostnames))
            .default_action(action)
            .run(["burrow"])
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::DuplicateFlag { .. })
        ));
        assert!(seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_command_required_without_default_action() {
        let dir = TempDir::new().unwrap();
        let err = app(&dir).run(["burrow"]).await.unwrap_err();

        assert!(err.downcast_ref::<clap::Error>().is_some());
        assert_ne!(exit_code(&err), exit::SUCCESS);
    }

    #[tokio::test]
    async fn test_nested_command_with_scoped_and_global_flags() {
        let dir = TempDir::new().unwrap();
        let tokens = TempDir::new().unwrap();
        std::fs::write(tokens.path().join("app.example.com-token"), "tok").unwrap();

        app(&dir)
            .contributor(Arc::new(AccessSubsystem::new().with_token_dir(tokens.path())))
            .run([
                "burrow",
                "access",
                "token",
                "--app",
                "https://app.example.com",
                "--hostname=edge",
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subcommand_sees_command_path() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct Nested(Arc<Mutex<Vec<String>>>);

        impl Contributor for Nested {
            fn name(&self) -> &'static str {
                "nested"
            }

            fn commands(&self) -> Vec<CommandDescriptor> {
                let seen = self.0.clone();
                vec![CommandDescriptor::new("outer", "Outer").subcommand(
                    CommandDescriptor::new("inner", "Inner").action(Action::new(
                        move |ctx: ActionContext| {
                            let seen = seen.clone();
                            async move {
                                *seen.lock().unwrap() = ctx.command.clone();
                                Ok(())
                            }
                        },
                    )),
                )]
            }
        }

        app(&dir)
            .contributor(Arc::new(Nested(seen.clone())))
            .run(["burrow", "outer", "inner"])
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), ["outer", "inner"]);
    }
}
