//! Host integration: turns process signals and the grace period into
//! closures of the shutdown signals.

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::util::shutdown::{HostTrigger, ShutdownController};

/// Listen for termination requests until forced shutdown.
///
/// The first SIGINT/SIGTERM asks for a graceful stop, the next one forces it.
pub fn spawn_signal_listener(controller: ShutdownController) -> Result<JoinHandle<()>> {
    let mut requests = termination_requests()?;
    let forced = controller.handles().forced;

    Ok(tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            tokio::select! {
                _ = forced.closed() => break,
                signal = requests.recv() => {
                    let Some(signal) = signal else { break };
                    received += 1;
                    let trigger = if received == 1 {
                        HostTrigger::GracefulStop
                    } else {
                        HostTrigger::ForceStop
                    };
                    info!("Received {signal}, requesting {trigger:?}");
                    controller.trigger(trigger);
                }
            }
        }
    }))
}

/// Once graceful shutdown starts, force it after `grace` unless it already
/// finished.
pub fn spawn_grace_timer(controller: ShutdownController, grace: Duration) -> JoinHandle<()> {
    let handles = controller.handles();

    tokio::spawn(async move {
        tokio::select! {
            _ = handles.forced.closed() => return,
            _ = handles.graceful.closed() => {}
        }

        tokio::select! {
            _ = handles.forced.closed() => {}
            _ = tokio::time::sleep(grace) => {
                if controller.close_forced() {
                    warn!("Grace period of {grace:?} elapsed, forcing shutdown");
                }
            }
        }
    })
}

/// Stream of termination signal names.
struct TerminationRequests {
    rx: tokio::sync::mpsc::Receiver<&'static str>,
}

impl TerminationRequests {
    async fn recv(&mut self) -> Option<&'static str> {
        self.rx.recv().await
    }
}

#[cfg(unix)]
fn termination_requests() -> Result<TerminationRequests> {
    use anyhow::Context;
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigterm.recv() => "SIGTERM",
                Some(()) = sigint.recv() => "SIGINT",
                else => break,
            };
            if tx.send(name).await.is_err() {
                break;
            }
        }
    });

    Ok(TerminationRequests { rx })
}

#[cfg(not(unix))]
fn termination_requests() -> Result<TerminationRequests> {
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            if tx.send("Ctrl-C").await.is_err() {
                break;
            }
        }
    });
    Ok(TerminationRequests { rx })
}
