//! Scripted forwarding engine for lifecycle tests

use async_trait::async_trait;
use limelight_forwarder::{ForwarderEngine, ForwarderError, ForwarderInstance};
use limelight_proto::Destination;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Something that happened to the engine, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Started(u16, Destination),
    Stopped(u16, Destination),
    Killed(u16, Destination),
}

#[derive(Default)]
struct State {
    events: Vec<EngineEvent>,
    failing_ports: HashSet<u16>,
    failing_hosts: HashSet<String>,
    unavailable: bool,
    start_delay: Option<Duration>,
}

/// Records starts and stops instead of forwarding anything
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    state: Arc<Mutex<State>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_port(&self, port: u16) {
        self.state.lock().unwrap().failing_ports.insert(port);
    }

    pub fn fail_host(&self, host: &str) {
        self.state.lock().unwrap().failing_hosts.insert(host.to_string());
    }

    /// Make every start take `delay`, like socat's start grace
    pub fn delay_starts(&self, delay: Duration) {
        self.state.lock().unwrap().start_delay = Some(delay);
    }

    pub fn set_unavailable(&self) {
        self.state.lock().unwrap().unavailable = true;
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Instances started and not yet stopped or killed
    pub fn alive(&self) -> Vec<(u16, Destination)> {
        let mut alive = Vec::new();
        for event in self.events() {
            match event {
                EngineEvent::Started(port, dest) => alive.push((port, dest)),
                EngineEvent::Stopped(port, dest) | EngineEvent::Killed(port, dest) => {
                    alive.retain(|entry| entry != &(port, dest.clone()));
                }
            }
        }
        alive
    }
}

#[async_trait]
impl ForwarderEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn check_available(&self) -> Result<(), ForwarderError> {
        if self.state.lock().unwrap().unavailable {
            return Err(ForwarderError::Unavailable("scripted engine disabled".into()));
        }
        Ok(())
    }

    async fn start(
        &self,
        listen_port: u16,
        destination: &Destination,
    ) -> Result<Box<dyn ForwarderInstance>, ForwarderError> {
        let delay = self.state.lock().unwrap().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.failing_ports.contains(&listen_port)
            || state.failing_hosts.contains(&destination.host)
        {
            return Err(ForwarderError::ExitedEarly {
                port: listen_port,
                status: "exit status: 1".into(),
            });
        }

        state
            .events
            .push(EngineEvent::Started(listen_port, destination.clone()));

        Ok(Box::new(ScriptedInstance {
            port: listen_port,
            destination: destination.clone(),
            state: self.state.clone(),
            done: false,
        }))
    }
}

struct ScriptedInstance {
    port: u16,
    destination: Destination,
    state: Arc<Mutex<State>>,
    done: bool,
}

#[async_trait]
impl ForwarderInstance for ScriptedInstance {
    fn describe(&self) -> String {
        format!("scripted {} -> {}", self.port, self.destination)
    }

    async fn stop(&mut self) -> Result<(), ForwarderError> {
        assert!(!self.done, "instance on port {} stopped twice", self.port);
        self.done = true;
        self.state
            .lock()
            .unwrap()
            .events
            .push(EngineEvent::Stopped(self.port, self.destination.clone()));
        Ok(())
    }

    fn kill_now(&mut self) {
        if !self.done {
            self.done = true;
            self.state
                .lock()
                .unwrap()
                .events
                .push(EngineEvent::Killed(self.port, self.destination.clone()));
        }
    }
}
