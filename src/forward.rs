//! Local to remote TCP tunnels through the agent channel.
//!
//! Ports are validated before anything touches the network. A tunnel runs
//! until the caller cancels it or drops its handle; if the agent drops the
//! session first the tunnel ends with [`OpsError::Session`] and is not
//! re-established.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use crate::backend::{AgentChannel, PortPair, SessionEnd};
use crate::error::OpsError;
use crate::target::Target;

/// Validates both ends of a tunnel.
///
/// # Errors
///
/// Returns [`OpsError::InvalidPort`] for values outside `1..=65535`.
pub fn validate_ports(local: u32, remote: u32) -> Result<PortPair, OpsError> {
    Ok(PortPair {
        local: port("local", local)?,
        remote: port("remote", remote)?,
    })
}

fn port(side: &'static str, value: u32) -> Result<u16, OpsError> {
    u16::try_from(value)
        .ok()
        .filter(|candidate| *candidate != 0)
        .ok_or(OpsError::InvalidPort { side, value })
}

/// Establishes tunnels.
#[derive(Clone)]
pub struct PortForwarder {
    agent: Arc<dyn AgentChannel>,
}

impl PortForwarder {
    /// Creates a forwarder.
    #[must_use]
    pub fn new(agent: Arc<dyn AgentChannel>) -> Self {
        Self { agent }
    }

    /// Runs the tunnel and blocks until `cancel` fires or the agent drops it.
    ///
    /// # Errors
    ///
    /// Returns [`OpsError::Session`] when the tunnel cannot be opened or
    /// drops before cancellation.
    pub async fn forward(
        &self,
        target: &Target,
        ports: PortPair,
        cancel: &CancellationToken,
    ) -> Result<(), OpsError> {
        info!(target = %target, local = ports.local, remote = ports.remote, "opening tunnel");
        let ended = self
            .agent
            .forward_port(target, ports, cancel)
            .await
            .map_err(|err| {
                OpsError::from_backend(err, &target.region, |other| OpsError::Session {
                    message: other.to_string(),
                })
            });
        match ended {
            Ok(SessionEnd::Cancelled) | Err(OpsError::Cancelled) => {
                info!(target = %target, local = ports.local, "tunnel closed");
                Ok(())
            }
            Ok(dropped) => {
                warn!(target = %target, end = ?dropped, "tunnel dropped");
                Err(OpsError::Session {
                    message: format!(
                        "tunnel {}->{} on {target} dropped ({dropped:?})",
                        ports.local, ports.remote
                    ),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Starts the tunnel in the background. It stops when `cancel` fires or
    /// the returned handle is dropped.
    #[must_use]
    pub fn spawn(
        &self,
        target: Target,
        ports: PortPair,
        cancel: &CancellationToken,
    ) -> TunnelHandle {
        let tunnel = cancel.child_token();
        let forwarder = self.clone();
        let token = tunnel.clone();
        let task = tokio::spawn(async move { forwarder.forward(&target, ports, &token).await });
        TunnelHandle {
            cancel: tunnel.clone(),
            _stop_on_drop: tunnel.drop_guard(),
            task,
        }
    }
}

/// A background tunnel. Dropping the handle closes the tunnel.
#[derive(Debug)]
pub struct TunnelHandle {
    cancel: CancellationToken,
    _stop_on_drop: DropGuard,
    task: JoinHandle<Result<(), OpsError>>,
}

impl TunnelHandle {
    /// Returns `true` once the tunnel has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Closes the tunnel and waits for it to wind down.
    ///
    /// # Errors
    ///
    /// Returns the tunnel's error when it dropped before being closed.
    pub async fn close(self) -> Result<(), OpsError> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Waits for the tunnel to end on its own.
    ///
    /// # Errors
    ///
    /// Returns [`OpsError::Session`] when the tunnel dropped or its task
    /// failed.
    pub async fn wait(self) -> Result<(), OpsError> {
        self.task.await.unwrap_or_else(|err| {
            Err(OpsError::Session {
                message: format!("tunnel task failed: {err}"),
            })
        })
    }
}
