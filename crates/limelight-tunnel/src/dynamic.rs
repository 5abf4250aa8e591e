//! The one tunnel whose destination is learned from registrations

use crate::registry::{TunnelId, TunnelRegistry};
use limelight_proto::{Destination, RegistrationResponse};
use std::net::IpAddr;
use tracing::{error, info};

/// Tracks at most one dynamic tunnel and replaces it on every registration
pub struct DynamicTunnelManager {
    /// Listen port locally and destination port on the registrant
    port: u16,
    current: Option<TunnelId>,
}

impl DynamicTunnelManager {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            current: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn current(&self) -> Option<TunnelId> {
        self.current
    }

    /// Point the dynamic tunnel at `peer_ip`.
    ///
    /// The previous tunnel is always torn down first. If the replacement fails
    /// to start, no dynamic tunnel is left running.
    pub async fn handle(
        &mut self,
        registry: &mut TunnelRegistry,
        peer_ip: IpAddr,
    ) -> RegistrationResponse {
        if let Some(previous) = self.current.take() {
            info!(tunnel_id = %previous, "Stopping the previous dynamic tunnel");
            registry.stop(previous).await;
        }

        let destination = Destination::from_ip(peer_ip, self.port);
        info!(destination = %destination, "Registering dynamic tunnel destination");

        match registry.start(self.port, destination).await {
            Ok(tunnel) => {
                self.current = Some(tunnel.id);
                RegistrationResponse::Registered
            }
            Err(e) => {
                error!(error = %e, "Failed to start the dynamic tunnel");
                RegistrationResponse::failed(e.to_string())
            }
        }
    }
}
