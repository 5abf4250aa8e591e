//! Tunnel lifecycle management
//!
//! Keeps a fixed set of static tunnels to the peripheral alive and maintains one
//! dynamic tunnel whose destination is announced at runtime by a registrant.
//!
//! # Architecture
//!
//! 1. **Startup**: the forwarding engine is checked, the registration port is
//!    bound, then one static tunnel per configured port is started
//! 2. **Registration loop**: each connection to the registration port is
//!    accepted and handled to completion before the next one
//! 3. **Dynamic swap**: the previous dynamic tunnel is stopped, then a new one
//!    is started towards the registrant's IP
//! 4. **Response**: `0` on success or an error description, then close
//! 5. **Shutdown**: every tunnel is stopped exactly once, in start order
//!
//! # Example Usage
//!
//! ```no_run
//! use limelight_forwarder::RelayEngine;
//! use limelight_tunnel::{ProxyConfig, TunnelService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::default();
//!     let mut service = TunnelService::start(&config, Arc::new(RelayEngine::default())).await?;
//!
//!     service.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
mod dynamic;
mod listener;
mod registry;
mod service;
mod static_set;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, EngineConfig, EngineKind, PeripheralConfig, ProxyConfig};
pub use dynamic::DynamicTunnelManager;
pub use listener::{ListenerError, RegistrationListener};
pub use registry::{RegistryError, TunnelId, TunnelInfo, TunnelRegistry, TunnelStatus};
pub use service::{ServiceError, TunnelService};
pub use static_set::{StaticTunnel, StaticTunnelSet};
