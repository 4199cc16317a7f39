//! Finding the console on the LAN.
//!
//! The client broadcasts a probe to the discovery port and takes the first
//! valid answer. Anything else that arrives (our own probe looping back,
//! other devices, garbage) is ignored until the attempt's deadline.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hp1000_core::{StationAddress, WireCodec};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::StationConfig;
use crate::events::{Events, LogCategory};
use crate::network::{self, create_broadcast_socket, NetworkError};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No console answered {attempts} discovery probe(s) sent to {target}")]
    NoResponse { attempts: u32, target: String },
    #[error("Cannot determine broadcast address: {0}")]
    NoBroadcastAddress(#[from] NetworkError),
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
}

/// Finds a console to talk to
#[async_trait]
pub trait Locate: Send {
    async fn locate(&mut self) -> Result<StationAddress, DiscoveryError>;
}

/// Where discovery probes go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastTarget {
    /// A configured address, broadcast or unicast
    Fixed(Ipv4Addr),
    /// The broadcast address of the named interface, or of the first
    /// suitable one; looked up again on every attempt
    Interface(Option<String>),
}

impl BroadcastTarget {
    pub fn from_config(config: &StationConfig) -> Self {
        match config.broadcast_address {
            Some(address) => BroadcastTarget::Fixed(address),
            None => BroadcastTarget::Interface(config.interface.clone()),
        }
    }

    fn resolve(&self) -> Result<Ipv4Addr, NetworkError> {
        match self {
            BroadcastTarget::Fixed(address) => Ok(*address),
            BroadcastTarget::Interface(name) => network::broadcast_address(name.as_deref()),
        }
    }
}

impl fmt::Display for BroadcastTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastTarget::Fixed(address) => write!(f, "{}", address),
            BroadcastTarget::Interface(Some(name)) => write!(f, "broadcast on {}", name),
            BroadcastTarget::Interface(None) => write!(f, "broadcast"),
        }
    }
}

/// UDP broadcast discovery
pub struct Discovery {
    codec: Arc<dyn WireCodec>,
    target: BroadcastTarget,
    port: u16,
    timeout: Duration,
    max_retry: u32,
    events: Events,
}

impl Discovery {
    pub fn new(
        codec: Arc<dyn WireCodec>,
        target: BroadcastTarget,
        port: u16,
        timeout: Duration,
        max_retry: u32,
        events: Events,
    ) -> Self {
        Discovery {
            codec,
            target,
            port,
            timeout,
            max_retry,
            events,
        }
    }

    pub fn from_config(codec: Arc<dyn WireCodec>, config: &StationConfig, events: Events) -> Self {
        Self::new(
            codec,
            BroadcastTarget::from_config(config),
            config.discovery_port,
            config.discovery_timeout,
            config.max_retry,
            events,
        )
    }

    /// One probe, then listen until the deadline
    async fn attempt(&self, destination: SocketAddrV4) -> Result<Option<StationAddress>, DiscoveryError> {
        let socket = create_broadcast_socket()?;
        socket.send_to(&self.codec.discovery_probe(), destination).await?;
        log::debug!("Discovery probe sent to {}", destination);

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 512];
        loop {
            let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => {
                    log::warn!("Discovery receive error: {}", e);
                    return Ok(None);
                }
                Ok(Ok(received)) => received,
            };
            let SocketAddr::V4(source) = from else {
                continue;
            };
            match self.codec.decode_discovery(&buf[..len], source) {
                Ok(station) => return Ok(Some(station)),
                Err(e) => log::trace!("Ignoring {} bytes from {}: {}", len, source, e),
            }
        }
    }
}

#[async_trait]
impl Locate for Discovery {
    /// Probe up to `max_retry` times.
    async fn locate(&mut self) -> Result<StationAddress, DiscoveryError> {
        let mut last_target = self.target.to_string();
        for attempt in 1..=self.max_retry {
            let address = match self.target.resolve() {
                Ok(address) => address,
                Err(e) => {
                    let e = DiscoveryError::from(e);
                    self.events.error(LogCategory::Discovery, &e);
                    return Err(e);
                }
            };
            let destination = SocketAddrV4::new(address, self.port);
            last_target = destination.to_string();

            if let Some(station) = self.attempt(destination).await? {
                self.events
                    .info(LogCategory::Discovery, format_args!("Found console {}", station));
                return Ok(station);
            }
            log::debug!(
                "No discovery response from {} (attempt {}/{})",
                destination,
                attempt,
                self.max_retry
            );
        }

        let e = DiscoveryError::NoResponse {
            attempts: self.max_retry,
            target: last_target,
        };
        self.events.error(LogCategory::Discovery, &e);
        Err(e)
    }
}
