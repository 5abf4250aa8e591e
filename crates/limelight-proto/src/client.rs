//! Registrant side of the protocol

use crate::response::{ProtoError, RegistrationResponse};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("Failed to connect to registration port at {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error while reading registration response: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy closed the connection without a response")]
    EmptyResponse,

    #[error("Proxy failed to set up forwarding: {0}")]
    Rejected(String),
}

impl From<ProtoError> for RegisterError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::EmptyResponse => RegisterError::EmptyResponse,
        }
    }
}

/// Announce this host as the dynamic tunnel destination.
///
/// Connects, sends nothing, and reads until the proxy closes the connection.
pub async fn register<A>(addr: A) -> Result<(), RegisterError>
where
    A: ToSocketAddrs + std::fmt::Display,
{
    let address = addr.to_string();
    let mut stream =
        TcpStream::connect(addr)
            .await
            .map_err(|source| RegisterError::ConnectionFailed {
                address: address.clone(),
                source,
            })?;

    debug!(address = %address, "Connected to registration port, waiting for response");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;

    match RegistrationResponse::decode(&response)? {
        RegistrationResponse::Registered => {
            info!(address = %address, "Registered with limelight proxy");
            Ok(())
        }
        RegistrationResponse::Failed(reason) => Err(RegisterError::Rejected(reason)),
    }
}
