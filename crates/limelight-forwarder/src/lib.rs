//! Forwarding engines
//!
//! A forwarding engine turns "listen on this port, relay to that `host:port`"
//! into a running instance that accepts any number of client connections and
//! pipes bytes in both directions. The tunnel manager only starts and stops
//! instances; it never touches the forwarded traffic.
//!
//! Two engines are provided:
//!
//! - [`SocatEngine`] launches one `socat` process per tunnel
//! - [`RelayEngine`] runs the relay in-process as a tokio accept loop

mod engine;
mod relay;
mod socat;

pub use engine::{ForwarderEngine, ForwarderError, ForwarderInstance};
pub use relay::RelayEngine;
pub use socat::{locate_socat, SocatEngine, DEFAULT_SOCAT_PATHS, DEFAULT_START_GRACE};
