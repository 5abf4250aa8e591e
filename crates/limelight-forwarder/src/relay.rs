//! In-process forwarding: one tokio accept loop per tunnel

use crate::engine::{ForwarderEngine, ForwarderError, ForwarderInstance};
use async_trait::async_trait;
use limelight_proto::Destination;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Relays connections itself instead of launching a helper program
#[derive(Debug, Clone)]
pub struct RelayEngine {
    bind_ip: IpAddr,
}

impl RelayEngine {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

#[async_trait]
impl ForwarderEngine for RelayEngine {
    fn name(&self) -> &'static str {
        "relay"
    }

    async fn check_available(&self) -> Result<(), ForwarderError> {
        Ok(())
    }

    async fn start(
        &self,
        listen_port: u16,
        destination: &Destination,
    ) -> Result<Box<dyn ForwarderInstance>, ForwarderError> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind_ip, listen_port))
            .await
            .map_err(|source| ForwarderError::BindFailed {
                port: listen_port,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "Connections to port {} will be forwarded to {} (in-process relay)",
            listen_port, destination
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(run_accept_loop(
            listener,
            destination.clone(),
            shutdown_rx,
        ));

        Ok(Box::new(RelayInstance {
            local_addr,
            destination: destination.clone(),
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }))
    }
}

struct RelayInstance {
    local_addr: SocketAddr,
    destination: Destination,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl ForwarderInstance for RelayInstance {
    fn describe(&self) -> String {
        format!("relay {} -> {}", self.local_addr, self.destination)
    }

    async fn stop(&mut self) -> Result<(), ForwarderError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| ForwarderError::TaskFailed(e.to_string()))?;
        }

        Ok(())
    }

    fn kill_now(&mut self) {
        self.shutdown_tx.take();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for RelayInstance {
    fn drop(&mut self) {
        self.kill_now();
    }
}

/// Accept until told to stop, then close the listener and abort in-flight relays
async fn run_accept_loop(
    listener: TcpListener,
    destination: Destination,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(destination = %destination, "Relay shutdown requested");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((client, peer_addr)) => {
                        debug!(
                            peer_addr = %peer_addr,
                            destination = %destination,
                            "Accepted relay connection"
                        );
                        connections.spawn(relay_connection(client, peer_addr, destination.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Relay accept error");
                    }
                }
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    connections.shutdown().await;
}

async fn relay_connection(mut client: TcpStream, peer_addr: SocketAddr, destination: Destination) {
    let mut server = match TcpStream::connect(destination.to_connect_string()).await {
        Ok(server) => server,
        Err(e) => {
            warn!(
                peer_addr = %peer_addr,
                destination = %destination,
                error = %e,
                "Failed to connect to destination"
            );
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut server).await {
        Ok((to_destination, to_client)) => {
            debug!(
                peer_addr = %peer_addr,
                destination = %destination,
                bytes_to_destination = to_destination,
                bytes_to_client = to_client,
                "Relay connection closed"
            );
        }
        Err(e) => {
            debug!(
                peer_addr = %peer_addr,
                destination = %destination,
                error = %e,
                "Relay connection ended with error"
            );
        }
    }
}
