//! End-to-end tunnel service tests over loopback
//!
//! Linux routes all of 127.0.0.0/8 to loopback, which lets one machine play
//! every role: tunnels listen on 127.0.0.1, the peripheral lives on 127.0.0.5
//! and registrants connect from 127.0.0.2 / 127.0.0.3.
#![cfg(target_os = "linux")]

use async_trait::async_trait;
use limelight_forwarder::{ForwarderEngine, ForwarderError, ForwarderInstance, RelayEngine};
use limelight_proto::{Destination, RegistrationResponse};
use limelight_tunnel::{
    EngineConfig, EngineKind, PeripheralConfig, ProxyConfig, ServiceError, TunnelService,
    TunnelStatus,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const PERIPHERAL: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 5);
const REGISTRANT_A: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);
const REGISTRANT_B: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 3);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo server that prefixes replies with a tag, so tests can tell servers apart
async fn spawn_tagged_echo(ip: Ipv4Addr, port: u16, tag: &'static str) {
    let listener = TcpListener::bind((ip, port)).await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let mut reply = tag.as_bytes().to_vec();
                    reply.extend_from_slice(&buf[..n]);
                    if socket.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

async fn exchange(port: u16, payload: &[u8], expected_len: usize) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; expected_len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("no reply through tunnel")
        .unwrap();
    buf
}

async fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Register from `source`, returning the raw response bytes
async fn register_from(source: Ipv4Addr, registration: SocketAddr) -> Vec<u8> {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind(SocketAddr::new(IpAddr::V4(source), 0)).unwrap();
    let mut stream = socket.connect(registration).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("no registration response")
        .unwrap();
    response
}

struct Ports {
    statics: Vec<u16>,
    dynamic: u16,
    registration: u16,
}

async fn ports(statics: usize) -> Ports {
    let mut all = Vec::new();
    while all.len() < statics + 2 {
        let port = free_port().await;
        if !all.contains(&port) {
            all.push(port);
        }
    }
    Ports {
        registration: all.pop().unwrap(),
        dynamic: all.pop().unwrap(),
        statics: all,
    }
}

fn config(ports: &Ports) -> ProxyConfig {
    ProxyConfig {
        peripheral: PeripheralConfig {
            address: PERIPHERAL.to_string(),
            ports: ports.statics.clone(),
        },
        dynamic_port: ports.dynamic,
        registration_port: ports.registration,
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        engine: EngineConfig {
            kind: EngineKind::Relay,
            ..EngineConfig::default()
        },
    }
}

fn relay() -> Arc<dyn ForwarderEngine> {
    Arc::new(RelayEngine::new(IpAddr::V4(Ipv4Addr::LOCALHOST)))
}

/// Run the service's registration loop in the background, handing the service
/// back when told to stop
fn spawn_service(
    mut service: TunnelService,
) -> (oneshot::Sender<()>, JoinHandle<TunnelService>) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        service
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        service
    });
    (stop_tx, handle)
}

/// Relay engine that refuses destinations on one host
struct RefusingEngine {
    inner: RelayEngine,
    refused_host: String,
}

#[async_trait]
impl ForwarderEngine for RefusingEngine {
    fn name(&self) -> &'static str {
        "refusing"
    }

    async fn check_available(&self) -> Result<(), ForwarderError> {
        Ok(())
    }

    async fn start(
        &self,
        listen_port: u16,
        destination: &Destination,
    ) -> Result<Box<dyn ForwarderInstance>, ForwarderError> {
        if destination.host == self.refused_host {
            return Err(ForwarderError::ExitedEarly {
                port: listen_port,
                status: "exit status: 1".to_string(),
            });
        }
        self.inner.start(listen_port, destination).await
    }
}

struct UnavailableEngine;

#[async_trait]
impl ForwarderEngine for UnavailableEngine {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn check_available(&self) -> Result<(), ForwarderError> {
        Err(ForwarderError::Unavailable("socat is not installed".to_string()))
    }

    async fn start(
        &self,
        _listen_port: u16,
        _destination: &Destination,
    ) -> Result<Box<dyn ForwarderInstance>, ForwarderError> {
        panic!("start must not be called on an unavailable engine");
    }
}

#[tokio::test]
async fn test_static_tunnels_forward_to_peripheral() {
    init_tracing();
    let ports = ports(2).await;
    spawn_tagged_echo(PERIPHERAL, ports.statics[0], "cam0:").await;
    spawn_tagged_echo(PERIPHERAL, ports.statics[1], "cam1:").await;

    let mut service = TunnelService::start(&config(&ports), relay()).await.unwrap();

    let tunnels: Vec<_> = service.registry().tunnels().cloned().collect();
    assert_eq!(tunnels.len(), 2);
    for (tunnel, port) in tunnels.iter().zip(&ports.statics) {
        assert_eq!(tunnel.listen_port, *port);
        assert_eq!(tunnel.destination, Destination::new(PERIPHERAL.to_string(), *port));
        assert_eq!(tunnel.status, TunnelStatus::Running);
    }

    assert_eq!(exchange(ports.statics[0], b"hi", 7).await, b"cam0:hi");
    assert_eq!(exchange(ports.statics[1], b"hi", 7).await, b"cam1:hi");
    assert!(service.dynamic_tunnel().is_none());

    service.shutdown().await;
    for port in &ports.statics {
        assert!(port_is_free(*port).await);
    }
}

#[tokio::test]
async fn test_reregistration_moves_dynamic_tunnel() {
    init_tracing();
    let ports = ports(2).await;
    for port in &ports.statics {
        spawn_tagged_echo(PERIPHERAL, *port, "cam:").await;
    }
    spawn_tagged_echo(REGISTRANT_A, ports.dynamic, "A:").await;
    spawn_tagged_echo(REGISTRANT_B, ports.dynamic, "B:").await;

    let service = TunnelService::start(&config(&ports), relay()).await.unwrap();
    let registration = service.registration_addr();
    let (stop_tx, handle) = spawn_service(service);

    // First registrant
    let response = register_from(REGISTRANT_A, registration).await;
    assert_eq!(response, RegistrationResponse::Registered.encode());
    assert_eq!(exchange(ports.dynamic, b"nt", 4).await, b"A:nt");
    assert_eq!(exchange(ports.statics[0], b"x", 5).await, b"cam:x");

    // Second registrant replaces the first
    let response = register_from(REGISTRANT_B, registration).await;
    assert_eq!(response, b"0");
    assert_eq!(exchange(ports.dynamic, b"nt", 4).await, b"B:nt");
    assert_eq!(exchange(ports.statics[1], b"y", 5).await, b"cam:y");

    stop_tx.send(()).unwrap();
    let mut service = handle.await.unwrap();

    let dynamic = service.dynamic_tunnel().unwrap();
    assert_eq!(
        dynamic.destination,
        Destination::new(REGISTRANT_B.to_string(), ports.dynamic)
    );
    // Two static tunnels plus exactly one dynamic one
    assert_eq!(service.registry().len(), 3);

    service.shutdown().await;
    assert!(service.registry().is_empty());
    assert!(port_is_free(ports.dynamic).await);
}

#[tokio::test]
async fn test_failed_registration_leaves_no_dynamic_tunnel() {
    init_tracing();
    let ports = ports(1).await;
    spawn_tagged_echo(PERIPHERAL, ports.statics[0], "cam:").await;

    let engine = Arc::new(RefusingEngine {
        inner: RelayEngine::new(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        refused_host: REGISTRANT_B.to_string(),
    });
    let service = TunnelService::start(&config(&ports), engine).await.unwrap();
    let registration = service.registration_addr();
    let (stop_tx, handle) = spawn_service(service);

    assert_eq!(register_from(REGISTRANT_A, registration).await, b"0");

    let response = register_from(REGISTRANT_B, registration).await;
    match RegistrationResponse::decode(&response).unwrap() {
        RegistrationResponse::Failed(reason) => {
            assert!(reason.contains(&REGISTRANT_B.to_string()), "reason: {}", reason);
        }
        RegistrationResponse::Registered => panic!("registration should have failed"),
    }

    // The tunnel towards A was torn down and nothing replaced it
    assert!(port_is_free(ports.dynamic).await);
    // Static tunnels are untouched
    assert_eq!(exchange(ports.statics[0], b"z", 5).await, b"cam:z");

    stop_tx.send(()).unwrap();
    let mut service = handle.await.unwrap();
    assert!(service.dynamic_tunnel().is_none());
    assert_eq!(service.registry().len(), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_registrant_disconnecting_early_does_not_stop_service() {
    init_tracing();
    let ports = ports(1).await;

    let service = TunnelService::start(&config(&ports), relay()).await.unwrap();
    let registration = service.registration_addr();
    let (stop_tx, handle) = spawn_service(service);

    // Connect and hang up without reading the response
    drop(TcpStream::connect(registration).await.unwrap());

    // The listener keeps serving
    let response = register_from(REGISTRANT_A, registration).await;
    assert_eq!(response, b"0");

    stop_tx.send(()).unwrap();
    let mut service = handle.await.unwrap();
    assert_eq!(
        service.dynamic_tunnel().map(|t| t.destination.host.clone()),
        Some(REGISTRANT_A.to_string())
    );
    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    init_tracing();
    let ports = ports(2).await;

    let service = TunnelService::start(&config(&ports), relay()).await.unwrap();
    let registration = service.registration_addr();
    let (stop_tx, handle) = spawn_service(service);
    assert_eq!(register_from(REGISTRANT_A, registration).await, b"0");
    stop_tx.send(()).unwrap();
    let mut service = handle.await.unwrap();

    service.shutdown().await;
    assert!(service.is_shut_down());
    service.shutdown().await;

    assert!(service.registry().is_empty());
    for port in ports.statics.iter().chain([&ports.dynamic]) {
        assert!(port_is_free(*port).await, "port {} still bound", port);
    }
}

#[tokio::test]
async fn test_static_failure_stops_already_started_tunnels() {
    init_tracing();
    let ports = ports(3).await;
    let _occupied = TcpListener::bind(("127.0.0.1", ports.statics[1])).await.unwrap();

    let err = TunnelService::start(&config(&ports), relay())
        .await
        .err()
        .expect("startup should fail");
    assert!(matches!(err, ServiceError::StaticTunnel(_)));

    // The first static tunnel was started then stopped again
    assert!(port_is_free(ports.statics[0]).await);
    assert!(port_is_free(ports.statics[2]).await);
}

#[tokio::test]
async fn test_registration_port_in_use_is_fatal_before_tunnels() {
    init_tracing();
    let ports = ports(1).await;
    let _occupied = TcpListener::bind(("127.0.0.1", ports.registration))
        .await
        .unwrap();

    let err = TunnelService::start(&config(&ports), relay())
        .await
        .err()
        .expect("startup should fail");
    assert!(matches!(err, ServiceError::Listener(_)));
    assert!(port_is_free(ports.statics[0]).await);
}

#[tokio::test]
async fn test_unavailable_engine_is_fatal() {
    init_tracing();
    let ports = ports(1).await;

    let err = TunnelService::start(&config(&ports), Arc::new(UnavailableEngine))
        .await
        .err()
        .expect("startup should fail");
    assert!(matches!(err, ServiceError::EngineUnavailable(_)));
    assert!(err.to_string().contains("socat is not installed"));
}
