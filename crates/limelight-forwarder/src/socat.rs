//! Forwarding through external `socat` processes

use crate::engine::{ForwarderEngine, ForwarderError, ForwarderInstance};
use async_trait::async_trait;
use limelight_proto::Destination;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Where socat is looked for when no explicit path is configured
pub const DEFAULT_SOCAT_PATHS: &[&str] = &["/usr/bin/socat", "/home/pi/socat"];

/// How long a freshly spawned socat is watched for an immediate exit
pub const DEFAULT_START_GRACE: Duration = Duration::from_millis(250);

/// Return the first candidate path that exists
pub fn locate_socat<P: AsRef<Path>>(candidates: &[P]) -> Result<PathBuf, ForwarderError> {
    candidates
        .iter()
        .map(|p| p.as_ref())
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            let searched = candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            ForwarderError::Unavailable(format!(
                "cannot find socat (searched: {}), try running: sudo apt-get install socat",
                searched
            ))
        })
}

/// Runs one `socat tcp-listen:<port>,fork,reuseaddr tcp:<host>:<port>` per tunnel
#[derive(Debug, Clone)]
pub struct SocatEngine {
    program: PathBuf,
    start_grace: Duration,
}

impl SocatEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            start_grace: DEFAULT_START_GRACE,
        }
    }

    /// Locate socat among `candidates`
    pub fn locate<P: AsRef<Path>>(candidates: &[P]) -> Result<Self, ForwarderError> {
        locate_socat(candidates).map(Self::new)
    }

    /// Zero disables the early-exit check
    pub fn with_start_grace(mut self, start_grace: Duration) -> Self {
        self.start_grace = start_grace;
        self
    }

    fn command_args(listen_port: u16, destination: &Destination) -> [String; 2] {
        [
            format!("tcp-listen:{},fork,reuseaddr", listen_port),
            format!("tcp:{}", destination.to_connect_string()),
        ]
    }
}

#[async_trait]
impl ForwarderEngine for SocatEngine {
    fn name(&self) -> &'static str {
        "socat"
    }

    async fn check_available(&self) -> Result<(), ForwarderError> {
        let status = Command::new(&self.program)
            .arg("-V")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                ForwarderError::Unavailable(format!(
                    "{} is not found or not allowed to execute ({}), try running: sudo apt-get install socat",
                    self.program.display(),
                    e
                ))
            })?;

        if !status.success() {
            return Err(ForwarderError::Unavailable(format!(
                "{} -V exited with {}",
                self.program.display(),
                status
            )));
        }

        debug!(program = %self.program.display(), "socat is available");
        Ok(())
    }

    async fn start(
        &self,
        listen_port: u16,
        destination: &Destination,
    ) -> Result<Box<dyn ForwarderInstance>, ForwarderError> {
        let args = Self::command_args(listen_port, destination);

        info!(
            "Connections to port {} will be forwarded to {}: {} {}",
            listen_port,
            destination,
            self.program.display(),
            args.join(" ")
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ForwarderError::SpawnFailed {
                program: self.program.clone(),
                source,
            })?;

        // socat reports bind failures by exiting, so watch it briefly
        if !self.start_grace.is_zero() {
            if let Ok(result) = tokio::time::timeout(self.start_grace, child.wait()).await {
                let status = result?;
                return Err(ForwarderError::ExitedEarly {
                    port: listen_port,
                    status: status.to_string(),
                });
            }
        }

        Ok(Box::new(SocatInstance {
            child,
            listen_port,
            destination: destination.clone(),
        }))
    }
}

struct SocatInstance {
    child: Child,
    listen_port: u16,
    destination: Destination,
}

impl SocatInstance {
    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        match self.child.id() {
            // SIGTERM lets socat pass the signal on to its forked children
            Some(pid) => {
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc == 0 {
                    Ok(())
                } else {
                    self.child.start_kill()
                }
            }
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

#[async_trait]
impl ForwarderInstance for SocatInstance {
    fn describe(&self) -> String {
        match self.child.id() {
            Some(pid) => format!(
                "socat pid {} ({} -> {})",
                pid, self.listen_port, self.destination
            ),
            None => format!("socat ({} -> {}, exited)", self.listen_port, self.destination),
        }
    }

    async fn stop(&mut self) -> Result<(), ForwarderError> {
        if let Err(e) = self.terminate() {
            warn!(
                port = self.listen_port,
                error = %e,
                "Failed to signal socat"
            );
        }

        let status = self.child.wait().await?;
        debug!(
            port = self.listen_port,
            status = %status,
            "socat exited"
        );
        Ok(())
    }

    fn kill_now(&mut self) {
        let _ = self.child.start_kill();
    }
}
