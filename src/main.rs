//! Limelight Proxy - keeps camera tunnels alive on the robot's Raspberry Pi
//!
//! Forwards the Limelight's ports through the Pi and points the NetworkTables
//! tunnel at whichever simulator host registered last.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use limelight_proto::DEFAULT_REGISTRATION_PORT;
use limelight_tunnel::{EngineKind, ProxyConfig, TunnelService};
use std::fs;
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Limelight Proxy - port forwarding between a robot's camera and the simulator
#[derive(Parser, Debug)]
#[command(name = "limelight-proxy")]
#[command(about = "Keep Limelight camera tunnels alive and route NetworkTables to the registered simulator")]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "LIMELIGHT_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy: static camera tunnels plus the registration listener
    #[command(long_about = r#"
Run the proxy on the Pi. Every camera port is forwarded to the same port on
the camera, and the NetworkTables port is forwarded to whichever host last
connected to the registration port.

EXAMPLES:
  # Standard deployment (socat, camera at 10.7.14.11)
  limelight-proxy serve

  # Different team number, in-process relay instead of socat
  limelight-proxy serve --peripheral-address 10.99.1.11 --engine relay

  # Settings from a file, CLI flags still win
  limelight-proxy serve --config /home/pi/limelight-proxy.yaml

ENVIRONMENT VARIABLES:
  LIMELIGHT_PERIPHERAL_ADDRESS  Camera address
  LIMELIGHT_PORTS               Comma-separated camera ports
  LIMELIGHT_DYNAMIC_PORT        NetworkTables tunnel port
  LIMELIGHT_REGISTRATION_PORT   Registration listener port
  LIMELIGHT_ENGINE              socat or relay
"#)]
    Serve(ServeArgs),

    /// Announce this host as the NetworkTables destination
    Register {
        /// Host running the proxy
        #[arg(long, env = "HALSIMWS_HOST")]
        host: String,

        /// Registration port on that host
        #[arg(long, default_value_t = DEFAULT_REGISTRATION_PORT)]
        port: u16,
    },
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Camera address; must match the address configured in the camera
    #[arg(long, env = "LIMELIGHT_PERIPHERAL_ADDRESS")]
    peripheral_address: Option<String>,

    /// Camera ports to forward, each to the same port on the camera
    #[arg(long, env = "LIMELIGHT_PORTS", value_delimiter = ',')]
    ports: Option<Vec<u16>>,

    /// NetworkTables port, forwarded to the same port on the registered host
    #[arg(long, env = "LIMELIGHT_DYNAMIC_PORT")]
    dynamic_port: Option<u16>,

    /// Port to listen on for registrations
    #[arg(long, env = "LIMELIGHT_REGISTRATION_PORT")]
    registration_port: Option<u16>,

    /// Interface for the registration listener
    #[arg(long, env = "LIMELIGHT_BIND_ADDRESS")]
    bind_address: Option<IpAddr>,

    /// Forwarding engine
    #[arg(long, value_enum, env = "LIMELIGHT_ENGINE")]
    engine: Option<EngineArg>,

    /// Path to socat (repeatable; first existing one is used)
    #[arg(long = "socat-path")]
    socat_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineArg {
    /// One socat process per tunnel
    Socat,
    /// Relay connections inside this process
    Relay,
}

impl From<EngineArg> for EngineKind {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Socat => EngineKind::Socat,
            EngineArg::Relay => EngineKind::Relay,
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ProxyConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ProxyConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_config(args: ServeArgs) -> Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ProxyConfig::default(),
    };

    if let Some(address) = args.peripheral_address {
        config.peripheral.address = address;
    }
    if let Some(ports) = args.ports {
        config.peripheral.ports = ports;
    }
    if let Some(port) = args.dynamic_port {
        config.dynamic_port = port;
    }
    if let Some(port) = args.registration_port {
        config.registration_port = port;
    }
    if let Some(address) = args.bind_address {
        config.bind_address = address;
    }
    if let Some(engine) = args.engine {
        config.engine.kind = engine.into();
    }
    if !args.socat_paths.is_empty() {
        config.engine.socat_paths = args.socat_paths;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM (kill, systemd).
///
/// The handlers are installed when this is called, not when the future is first
/// polled, so a signal that arrives during startup is not lost.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let streams = {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => Some((sigterm, sigint)),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers ({}), falling back to Ctrl+C", e);
                None
            }
        }
    };

    async move {
        #[cfg(unix)]
        if let Some((mut sigterm, mut sigint)) = streams {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT (Ctrl+C)"),
            }
            return;
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = build_config(args).context("Failed to build proxy configuration")?;

    info!("Peripheral: {}", config.peripheral.address);
    info!("Static ports: {:?}", config.peripheral.ports);
    info!("Dynamic tunnel port: {}", config.dynamic_port);
    info!("Registration port: {}", config.registration_port);

    let engine = config.engine.build()?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let Some(mut service) = TunnelService::start_until(&config, engine, &mut shutdown)
        .await
        .context("Failed to start tunnel service")?
    else {
        info!("Limelight proxy stopped during startup");
        return Ok(());
    };

    service.run(&mut shutdown).await;
    service.shutdown().await;

    info!("Limelight proxy stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Serve(args) => {
            info!("Limelight proxy starting...");
            serve(args).await
        }
        Commands::Register { host, port } => {
            let address = format!("{}:{}", host, port);
            limelight_proto::register(address.clone())
                .await
                .with_context(|| format!("Registration with {} failed", address))?;
            println!("Registered with limelight proxy at {}", address);
            Ok(())
        }
    }
}
