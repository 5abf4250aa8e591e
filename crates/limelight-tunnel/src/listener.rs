//! Registration listener
//!
//! Connections are handled strictly one at a time: accept, hand the peer's IP
//! to the dynamic tunnel manager, write the single response, close. Waiting in
//! `accept` is the only point where the loop yields between registrations.

use crate::dynamic::DynamicTunnelManager;
use crate::registry::TunnelRegistry;
use limelight_proto::RegistrationResponse;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind registration port {address}: {source}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}")]
    BindError {
        address: SocketAddr,
        port: u16,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct RegistrationListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RegistrationListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::BindError {
                address: addr,
                port: addr.port(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!("Registration listener bound on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next registrant. Only its IP matters.
    ///
    /// IPv4 peers of a dual-stack listener arrive as `::ffff:a.b.c.d` and are
    /// reported as plain IPv4.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, IpAddr)> {
        let (stream, peer_addr) = self.listener.accept().await?;
        Ok((stream, peer_addr.ip().to_canonical()))
    }

    /// Serve registrations until `shutdown` resolves.
    ///
    /// Shutdown is only observed while waiting for a connection; a registration
    /// that has been accepted always runs to completion.
    pub async fn run<F>(
        &self,
        registry: &mut TunnelRegistry,
        manager: &mut DynamicTunnelManager,
        shutdown: F,
    ) where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, registration listener stopping");
                    break;
                }
                accepted = self.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_ip)) => {
                    Self::serve(stream, peer_ip, registry, manager).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept registration connection");
                }
            }
        }
    }

    /// Dispatch one accepted registration and respond on the same connection
    pub async fn serve(
        stream: TcpStream,
        peer_ip: IpAddr,
        registry: &mut TunnelRegistry,
        manager: &mut DynamicTunnelManager,
    ) -> RegistrationResponse {
        info!(peer_ip = %peer_ip, "Registration received");

        let response = manager.handle(registry, peer_ip).await;
        Self::respond(stream, peer_ip, &response).await;
        response
    }

    /// Write the response and close. Delivery failures are logged, never raised.
    async fn respond(mut stream: TcpStream, peer_ip: IpAddr, response: &RegistrationResponse) {
        let bytes = response.encode();

        if let Err(e) = stream.write_all(&bytes).await {
            warn!(
                peer_ip = %peer_ip,
                error = %e,
                "Failed to deliver registration response"
            );
            return;
        }

        if let Err(e) = stream.shutdown().await {
            debug!(
                peer_ip = %peer_ip,
                error = %e,
                "Error closing registration connection"
            );
        }

        debug!(
            peer_ip = %peer_ip,
            success = response.is_success(),
            "Registration response sent"
        );
    }
}
