//! Live tunnel registry
//!
//! The registry is the single owner of every running forwarder instance. It is
//! not shared between tasks: the service drives it from one sequential control
//! flow, so there is no locking here.

use limelight_forwarder::{ForwarderEngine, ForwarderError, ForwarderInstance};
use limelight_proto::Destination;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Port {port} already has a running tunnel ({existing})")]
    PortInUse { port: u16, existing: TunnelId },

    #[error("Failed to start tunnel from port {port} to {destination}: {source}")]
    StartFailed {
        port: u16,
        destination: Destination,
        #[source]
        source: ForwarderError,
    },
}

/// Identifies a tunnel for as long as it is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(u64);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Running,
    Stopped,
}

/// Snapshot of a tunnel, handed out instead of the engine handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: TunnelId,
    pub listen_port: u16,
    pub destination: Destination,
    pub status: TunnelStatus,
}

struct Tunnel {
    info: TunnelInfo,
    handle: Box<dyn ForwarderInstance>,
}

pub struct TunnelRegistry {
    engine: Arc<dyn ForwarderEngine>,
    /// Start order, which is also shutdown order
    tunnels: Vec<Tunnel>,
    next_id: u64,
}

impl TunnelRegistry {
    pub fn new(engine: Arc<dyn ForwarderEngine>) -> Self {
        Self {
            engine,
            tunnels: Vec::new(),
            next_id: 1,
        }
    }

    /// Start forwarding `listen_port` to `destination`
    pub async fn start(
        &mut self,
        listen_port: u16,
        destination: Destination,
    ) -> Result<TunnelInfo, RegistryError> {
        if let Some(existing) = self.find_by_port(listen_port) {
            return Err(RegistryError::PortInUse {
                port: listen_port,
                existing: existing.id,
            });
        }

        let handle = self
            .engine
            .start(listen_port, &destination)
            .await
            .map_err(|source| RegistryError::StartFailed {
                port: listen_port,
                destination: destination.clone(),
                source,
            })?;

        let id = TunnelId(self.next_id);
        self.next_id += 1;

        let info = TunnelInfo {
            id,
            listen_port,
            destination,
            status: TunnelStatus::Running,
        };

        info!(
            tunnel_id = %id,
            port = listen_port,
            destination = %info.destination,
            instance = %handle.describe(),
            "Tunnel started"
        );

        self.tunnels.push(Tunnel {
            info: info.clone(),
            handle,
        });

        Ok(info)
    }

    /// Stop one tunnel and wait for its forwarder to exit.
    ///
    /// Returns the final snapshot (status `Stopped`). Stopping an id that is not
    /// registered is a caller bug.
    pub async fn stop(&mut self, id: TunnelId) -> Option<TunnelInfo> {
        let index = self.tunnels.iter().position(|t| t.info.id == id);
        debug_assert!(index.is_some(), "stop called for unregistered {}", id);

        let Some(index) = index else {
            error!(tunnel_id = %id, "Attempted to stop a tunnel that is not registered");
            return None;
        };

        let tunnel = self.tunnels.remove(index);
        Some(Self::stop_tunnel(tunnel).await)
    }

    /// Stop every live tunnel in start order. Returns how many were stopped.
    pub async fn stop_all(&mut self) -> usize {
        if self.tunnels.is_empty() {
            debug!("No tunnels to stop");
            return 0;
        }

        info!(count = self.tunnels.len(), "Stopping tunnels");

        let tunnels: Vec<Tunnel> = self.tunnels.drain(..).collect();
        let count = tunnels.len();
        for tunnel in tunnels {
            Self::stop_tunnel(tunnel).await;
        }

        info!("Tunnels stopped");
        count
    }

    async fn stop_tunnel(mut tunnel: Tunnel) -> TunnelInfo {
        debug!(
            tunnel_id = %tunnel.info.id,
            instance = %tunnel.handle.describe(),
            "Stopping tunnel"
        );

        if let Err(e) = tunnel.handle.stop().await {
            warn!(
                tunnel_id = %tunnel.info.id,
                port = tunnel.info.listen_port,
                error = %e,
                "Forwarder did not stop cleanly"
            );
        }

        tunnel.info.status = TunnelStatus::Stopped;

        info!(
            tunnel_id = %tunnel.info.id,
            port = tunnel.info.listen_port,
            destination = %tunnel.info.destination,
            "Tunnel stopped"
        );

        tunnel.info
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn get(&self, id: TunnelId) -> Option<&TunnelInfo> {
        self.tunnels
            .iter()
            .find(|t| t.info.id == id)
            .map(|t| &t.info)
    }

    pub fn find_by_port(&self, port: u16) -> Option<&TunnelInfo> {
        self.tunnels
            .iter()
            .find(|t| t.info.listen_port == port)
            .map(|t| &t.info)
    }

    /// Live tunnels in start order
    pub fn tunnels(&self) -> impl Iterator<Item = &TunnelInfo> {
        self.tunnels.iter().map(|t| &t.info)
    }
}

impl Drop for TunnelRegistry {
    fn drop(&mut self) {
        if self.tunnels.is_empty() {
            return;
        }

        warn!(
            count = self.tunnels.len(),
            "Tunnel registry dropped with live tunnels, killing them"
        );
        for tunnel in &mut self.tunnels {
            tunnel.handle.kill_now();
        }
    }
}
