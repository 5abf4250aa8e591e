use async_trait::async_trait;
use limelight_proto::Destination;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while starting or stopping a forwarder
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Forwarding engine unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to launch {program}: {source}")]
    SpawnFailed {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("Forwarder for port {port} exited right after start ({status})")]
    ExitedEarly { port: u16, status: String },

    #[error("Failed to bind port {port}: {source}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}")]
    BindFailed { port: u16, source: std::io::Error },

    #[error("Forwarder task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates forwarding instances
#[async_trait]
pub trait ForwarderEngine: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Verify the engine can start instances at all.
    ///
    /// Called once before any tunnel starts; an error here is fatal.
    async fn check_available(&self) -> Result<(), ForwarderError>;

    /// Start relaying connections accepted on `listen_port` to `destination`
    async fn start(
        &self,
        listen_port: u16,
        destination: &Destination,
    ) -> Result<Box<dyn ForwarderInstance>, ForwarderError>;
}

/// A running forwarder
#[async_trait]
pub trait ForwarderInstance: Send {
    /// Human-readable identity (pid, listen address) for logs
    fn describe(&self) -> String;

    /// Terminate the instance and wait until it has fully exited and released
    /// its listening port.
    async fn stop(&mut self) -> Result<(), ForwarderError>;

    /// Best-effort termination without waiting, for use from `Drop`
    fn kill_now(&mut self);
}
