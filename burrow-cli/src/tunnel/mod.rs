//! Tunnel subsystem. Owns the lifetime of the tunnel: validates the origin,
//! keeps probing it and runs the auto-updater until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::{Client, Url};
use tracing::{debug, info, warn};

use crate::registry::{
    Action, ActionContext, CommandDescriptor, Contributor, FlagDescriptor, FlagTable, FlagValue,
};
use crate::telemetry;
use crate::update::{UpdateSource, auto_update_loop, autoupdate_interval};
use crate::util::shutdown::ShutdownHandles;

pub const HOSTNAME_FLAG: &str = "hostname";
pub const URL_FLAG: &str = "url";
pub const METRICS_FLAG: &str = "metrics";

const DEFAULT_ORIGIN_URL: &str = "http://localhost:8080";
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct TunnelSubsystem {
    updater: Arc<dyn UpdateSource>,
    probe_interval: Duration,
}

impl TunnelSubsystem {
    pub fn new(updater: Arc<dyn UpdateSource>) -> Self {
        Self {
            updater,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// `start_server` as an [`Action`], used by the `tunnel` command and as
    /// the binary's default action.
    pub fn start_action(&self) -> Action {
        let tunnel = self.clone();
        Action::new(move |ctx| {
            let tunnel = tunnel.clone();
            async move { tunnel.start_server(ctx).await }
        })
    }

    pub async fn start_server(&self, ctx: ActionContext) -> Result<()> {
        let origin = origin_url(&ctx.flags)?;
        let hostname = ctx.flags.string(HOSTNAME_FLAG).unwrap_or("<unassigned>");
        info!("Starting tunnel for {} → {}", hostname, origin);

        if let Some(addr) = metrics_addr(&ctx.flags)? {
            telemetry::install_exporter(addr)?;
            telemetry::register_build_info(&ctx.version);
        }

        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("Failed to build origin client")?;

        let probe = probe_origin_loop(
            client,
            origin,
            self.probe_interval,
            ctx.shutdown.clone(),
        );

        let updater = self.updater.clone();
        let interval = autoupdate_interval(&ctx.flags);
        let version = ctx.version.clone();
        let shutdown = ctx.shutdown.clone();
        let update = async move {
            match interval {
                Some(interval) => auto_update_loop(updater, &version, interval, shutdown).await,
                None => {
                    debug!("Auto-update disabled");
                    Ok(())
                }
            }
        };

        tokio::try_join!(probe, update)?;
        info!("Tunnel stopped");
        Ok(())
    }
}

impl Contributor for TunnelSubsystem {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    fn flags(&self) -> Vec<FlagDescriptor> {
        vec![
            FlagDescriptor::string(HOSTNAME_FLAG, "Set a hostname on an edge server to route traffic to")
                .env("TUNNEL_HOSTNAME"),
            FlagDescriptor::string(URL_FLAG, "Connect to the local webserver at URL")
                .default_value(FlagValue::Str(DEFAULT_ORIGIN_URL.to_string()))
                .env("TUNNEL_URL"),
            FlagDescriptor::string(METRICS_FLAG, "Listen address (ip:port) for Prometheus metrics")
                .env("TUNNEL_METRICS"),
        ]
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("tunnel", "Expose a local origin through the edge")
                .description(
                    "Runs the tunnel in the foreground. Also started when no command is given.",
                )
                .action(self.start_action()),
        ]
    }
}

/// The `url` flag as an http(s) URL.
pub fn origin_url(flags: &FlagTable) -> Result<Url> {
    let raw = flags.string(URL_FLAG).unwrap_or(DEFAULT_ORIGIN_URL);
    let url = Url::parse(raw).with_context(|| format!("Invalid origin URL {raw:?}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => bail!("Unsupported origin scheme {scheme:?} in {raw:?}, expected http or https"),
    }
}

fn metrics_addr(flags: &FlagTable) -> Result<Option<SocketAddr>> {
    flags
        .string(METRICS_FLAG)
        .map(|raw| {
            raw.parse::<SocketAddr>()
                .with_context(|| format!("Invalid metrics address {raw:?}, expected ip:port"))
        })
        .transpose()
}

/// Probe the origin every `interval` until shutdown.
///
/// Graceful shutdown lets an in-flight probe finish, forced shutdown drops it.
async fn probe_origin_loop(
    client: Client,
    origin: Url,
    interval: Duration,
    shutdown: ShutdownHandles,
) -> Result<()> {
    let mut reachable = None;
    loop {
        if shutdown.is_stopping() {
            break;
        }

        let now_reachable = tokio::select! {
            _ = shutdown.forced.closed() => break,
            ok = probe_origin(&client, &origin) => ok,
        };
        if reachable != Some(now_reachable) {
            if now_reachable {
                info!("Origin {} is reachable", origin);
            } else {
                warn!("Origin {} is unreachable", origin);
            }
            reachable = Some(now_reachable);
        }

        tokio::select! {
            _ = shutdown.stopping() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!("Origin probe stopping");
    Ok(())
}

async fn probe_origin(client: &Client, origin: &Url) -> bool {
    match client.head(origin.clone()).send().await {
        Ok(response) => {
            debug!("Origin answered {}", response.status());
            true
        }
        Err(e) => {
            debug!("Origin probe failed: {e}");
            false
        }
    }
}
