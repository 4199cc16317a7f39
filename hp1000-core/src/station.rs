//! Discovered station identity

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};

/// A console found by discovery.
///
/// Lives as long as the session built on it; dropped when the link is lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationAddress {
    /// Device name from the discovery response, e.g. "HP2000"
    pub name: String,
    /// MAC address text as reported by the console
    pub mac: Option<String>,
    /// IPv4 address the console reports for itself
    pub ip: Ipv4Addr,
    /// Where the discovery response came from
    pub source: SocketAddrV4,
}

impl StationAddress {
    /// Stable identity of the console: its MAC address, or its IP when the
    /// console didn't report one.
    pub fn identity(&self) -> String {
        match &self.mac {
            Some(mac) => mac.clone(),
            None => self.ip.to_string(),
        }
    }
}

impl std::fmt::Display for StationAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) at {}", self.name, self.identity(), self.ip)
    }
}
