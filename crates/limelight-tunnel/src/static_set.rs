//! Tunnels to the peripheral that live for the whole process

use crate::registry::{RegistryError, TunnelInfo, TunnelRegistry};
use limelight_proto::Destination;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTunnel {
    pub listen_port: u16,
    pub destination: Destination,
}

/// Fixed list of tunnels started once at startup
#[derive(Debug, Clone, Default)]
pub struct StaticTunnelSet {
    entries: Vec<StaticTunnel>,
}

impl StaticTunnelSet {
    pub fn new(entries: Vec<StaticTunnel>) -> Self {
        Self { entries }
    }

    /// Forward each port to the same port on `peripheral`
    pub fn mirrored(peripheral: &str, ports: &[u16]) -> Self {
        Self::new(
            ports
                .iter()
                .map(|&port| StaticTunnel {
                    listen_port: port,
                    destination: Destination::new(peripheral, port),
                })
                .collect(),
        )
    }

    pub fn entries(&self) -> &[StaticTunnel] {
        &self.entries
    }

    /// Start every entry. The first failure aborts; tunnels already started stay
    /// in the registry for the caller's shutdown to clean up.
    pub async fn start(
        &self,
        registry: &mut TunnelRegistry,
    ) -> Result<Vec<TunnelInfo>, RegistryError> {
        let mut started = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let tunnel = registry
                .start(entry.listen_port, entry.destination.clone())
                .await?;
            started.push(tunnel);
        }

        info!(count = started.len(), "Static tunnels started");
        Ok(started)
    }
}
