//! Forwarding destinations (`host:port`)

use std::fmt;
use std::net::IpAddr;

/// Where a tunnel relays its accepted connections to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Destination on a peer identified only by its IP address
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self::new(ip.to_string(), port)
    }

    /// Address string accepted by `TcpStream::connect` and by socat's `tcp:` address
    pub fn to_connect_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
