//! Startup and shutdown wiring
//!
//! Startup order matters: the engine is checked and the registration port is
//! bound before any tunnel starts, so those failures never leave forwarders
//! behind. A static tunnel failure tears down whatever already started, and so
//! does a shutdown request that arrives while static tunnels are starting.

use crate::config::{ConfigError, ProxyConfig};
use crate::dynamic::DynamicTunnelManager;
use crate::listener::{ListenerError, RegistrationListener};
use crate::registry::{RegistryError, TunnelInfo, TunnelRegistry};
use limelight_forwarder::{ForwarderEngine, ForwarderError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Errors that prevent the service from starting
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    EngineUnavailable(ForwarderError),

    #[error("Registration listener failed: {0}")]
    Listener(#[from] ListenerError),

    #[error("Static tunnel failed: {0}")]
    StaticTunnel(#[from] RegistryError),
}

pub struct TunnelService {
    registry: TunnelRegistry,
    dynamic: DynamicTunnelManager,
    listener: RegistrationListener,
    shut_down: bool,
}

impl TunnelService {
    /// Check the engine, bind the registration port and start the static tunnels
    pub async fn start(
        config: &ProxyConfig,
        engine: Arc<dyn ForwarderEngine>,
    ) -> Result<Self, ServiceError> {
        let (mut registry, listener) = Self::prepare(config, engine).await?;

        let started = config.static_tunnels().start(&mut registry).await;
        Self::finish_startup(config, registry, listener, started).await
    }

    /// Like [`TunnelService::start`], but gives up as soon as `shutdown`
    /// resolves. Tunnels already started are stopped and `Ok(None)` is returned.
    pub async fn start_until<F>(
        config: &ProxyConfig,
        engine: Arc<dyn ForwarderEngine>,
        shutdown: F,
    ) -> Result<Option<Self>, ServiceError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let (mut registry, listener) = Self::prepare(config, engine).await?;
        let static_tunnels = config.static_tunnels();

        let started = tokio::select! {
            biased;
            _ = &mut shutdown => None,
            started = static_tunnels.start(&mut registry) => Some(started),
        };

        let Some(started) = started else {
            info!(
                started = registry.len(),
                "Shutdown requested during startup, stopping started tunnels"
            );
            registry.stop_all().await;
            return Ok(None);
        };

        Self::finish_startup(config, registry, listener, started)
            .await
            .map(Some)
    }

    async fn prepare(
        config: &ProxyConfig,
        engine: Arc<dyn ForwarderEngine>,
    ) -> Result<(TunnelRegistry, RegistrationListener), ServiceError> {
        config.validate()?;

        engine
            .check_available()
            .await
            .map_err(ServiceError::EngineUnavailable)?;
        info!(engine = engine.name(), "Forwarding engine available");

        let listener = RegistrationListener::bind(config.registration_addr()).await?;

        Ok((TunnelRegistry::new(engine), listener))
    }

    async fn finish_startup(
        config: &ProxyConfig,
        mut registry: TunnelRegistry,
        listener: RegistrationListener,
        started: Result<Vec<TunnelInfo>, RegistryError>,
    ) -> Result<Self, ServiceError> {
        if let Err(e) = started {
            error!(error = %e, "Failed to start static tunnels");
            registry.stop_all().await;
            return Err(e.into());
        }

        Ok(Self {
            registry,
            dynamic: DynamicTunnelManager::new(config.dynamic_port),
            listener,
            shut_down: false,
        })
    }

    pub fn registration_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn dynamic_tunnel(&self) -> Option<&TunnelInfo> {
        self.dynamic
            .current()
            .and_then(|id| self.registry.get(id))
    }

    /// Serve registrations until `shutdown` resolves. Does not stop tunnels;
    /// call [`TunnelService::shutdown`] afterwards.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            registration_addr = %self.listener.local_addr(),
            dynamic_port = self.dynamic.port(),
            "Waiting for registrations"
        );

        self.listener
            .run(&mut self.registry, &mut self.dynamic, shutdown)
            .await;
    }

    /// Stop every tunnel, static and dynamic. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let stopped = self.registry.stop_all().await;
        info!(stopped, "Tunnel service shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}
