//! Proxy configuration
//!
//! Defaults describe the standard robot deployment: a Limelight camera at
//! 10.7.14.11 behind a Raspberry Pi, NetworkTables on 1735 and registrations on
//! 5899.

use crate::static_set::StaticTunnelSet;
use limelight_forwarder::{
    ForwarderEngine, ForwarderError, RelayEngine, SocatEngine, DEFAULT_SOCAT_PATHS,
    DEFAULT_START_GRACE,
};
use limelight_proto::{DEFAULT_DYNAMIC_PORT, DEFAULT_REGISTRATION_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Ports the Limelight manual asks to forward
pub const DEFAULT_PERIPHERAL_PORTS: &[u16] = &[5800, 5801, 5802, 5803, 5804, 5805, 5806, 5807];

pub const DEFAULT_PERIPHERAL_ADDRESS: &str = "10.7.14.11";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Peripheral address cannot be empty")]
    EmptyPeripheralAddress,

    #[error("Port 0 is not allowed for {0}")]
    ZeroPort(&'static str),

    #[error("Static port {0} is listed more than once")]
    DuplicateStaticPort(u16),

    #[error("{what} port {port} is also a static tunnel port")]
    PortClash { what: &'static str, port: u16 },

    #[error("Dynamic tunnel port and registration port are both {0}")]
    DynamicRegistrationClash(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    pub peripheral: PeripheralConfig,

    /// Local listen port of the dynamic tunnel, also its destination port
    pub dynamic_port: u16,

    pub registration_port: u16,

    /// Interface the registration listener binds to
    pub bind_address: IpAddr,

    pub engine: EngineConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            peripheral: PeripheralConfig::default(),
            dynamic_port: DEFAULT_DYNAMIC_PORT,
            registration_port: DEFAULT_REGISTRATION_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Must match the address configured in the camera
    pub address: String,

    /// Each port forwards to the same port on the peripheral
    pub ports: Vec<u16>,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_PERIPHERAL_ADDRESS.to_string(),
            ports: DEFAULT_PERIPHERAL_PORTS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Socat,
    Relay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,

    /// Candidate socat locations, first existing one wins
    pub socat_paths: Vec<PathBuf>,

    /// How long a new socat is watched for an immediate exit
    pub start_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Socat,
            socat_paths: DEFAULT_SOCAT_PATHS.iter().map(PathBuf::from).collect(),
            start_grace_ms: DEFAULT_START_GRACE.as_millis() as u64,
        }
    }
}

impl EngineConfig {
    pub fn build(&self) -> Result<Arc<dyn ForwarderEngine>, ForwarderError> {
        match self.kind {
            EngineKind::Socat => {
                let engine = SocatEngine::locate(self.socat_paths.as_slice())?
                    .with_start_grace(Duration::from_millis(self.start_grace_ms));
                Ok(Arc::new(engine))
            }
            EngineKind::Relay => Ok(Arc::new(RelayEngine::default())),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peripheral.address.trim().is_empty() {
            return Err(ConfigError::EmptyPeripheralAddress);
        }

        if self.dynamic_port == 0 {
            return Err(ConfigError::ZeroPort("the dynamic tunnel"));
        }
        if self.registration_port == 0 {
            return Err(ConfigError::ZeroPort("registration"));
        }

        let mut seen = HashSet::new();
        for &port in &self.peripheral.ports {
            if port == 0 {
                return Err(ConfigError::ZeroPort("a static tunnel"));
            }
            if !seen.insert(port) {
                return Err(ConfigError::DuplicateStaticPort(port));
            }
        }

        if seen.contains(&self.dynamic_port) {
            return Err(ConfigError::PortClash {
                what: "Dynamic tunnel",
                port: self.dynamic_port,
            });
        }
        if seen.contains(&self.registration_port) {
            return Err(ConfigError::PortClash {
                what: "Registration",
                port: self.registration_port,
            });
        }
        if self.dynamic_port == self.registration_port {
            return Err(ConfigError::DynamicRegistrationClash(self.dynamic_port));
        }

        Ok(())
    }

    pub fn registration_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.registration_port)
    }

    pub fn static_tunnels(&self) -> StaticTunnelSet {
        StaticTunnelSet::mirrored(&self.peripheral.address, &self.peripheral.ports)
    }
}
