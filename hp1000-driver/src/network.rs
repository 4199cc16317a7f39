//! Host network interfaces and socket setup for discovery and the session.

use socket2::{Domain, Protocol, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Cannot list network interfaces: {0}")]
    InterfaceList(String),
    #[error("Interface '{0}' not found or has no IPv4 address")]
    InterfaceNotFound(String),
    #[error("No interface with an IPv4 broadcast address")]
    NoBroadcastInterface,
}

/// IPv4 configuration of one network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicV4 {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
    pub broadcast: Option<Ipv4Addr>,
}

impl NicV4 {
    /// The directed broadcast address of this NIC's subnet
    pub fn broadcast_address(&self) -> Option<Ipv4Addr> {
        self.broadcast.or_else(|| {
            self.netmask
                .map(|netmask| Ipv4Addr::from(u32::from(self.ip) | !u32::from(netmask)))
        })
    }
}

/// All IPv4 addresses of all interfaces
pub fn list_ipv4() -> Result<Vec<NicV4>, NetworkError> {
    use network_interface::{NetworkInterface, NetworkInterfaceConfig};

    let interfaces =
        NetworkInterface::show().map_err(|e| NetworkError::InterfaceList(e.to_string()))?;

    let mut nics = Vec::new();
    for itf in &interfaces {
        for addr in &itf.addr {
            if let IpAddr::V4(ip) = addr.ip() {
                let netmask = match addr.netmask() {
                    Some(IpAddr::V4(netmask)) => Some(netmask),
                    _ => None,
                };
                let broadcast = match addr.broadcast() {
                    Some(IpAddr::V4(broadcast)) => Some(broadcast),
                    _ => None,
                };
                nics.push(NicV4 {
                    name: itf.name.clone(),
                    ip,
                    netmask,
                    broadcast,
                });
            }
        }
    }
    Ok(nics)
}

/// Pick the broadcast address for discovery.
///
/// With an interface name, that interface's address is used (loopback
/// included, which is handy for testing). Without one, the first non-loopback
/// interface with a usable broadcast address wins.
pub fn choose_broadcast(nics: &[NicV4], interface: Option<&str>) -> Result<Ipv4Addr, NetworkError> {
    match interface {
        Some(name) => nics
            .iter()
            .filter(|nic| nic.name == name)
            .find_map(|nic| nic.broadcast_address())
            .ok_or_else(|| NetworkError::InterfaceNotFound(name.to_string())),
        None => nics
            .iter()
            .filter(|nic| !nic.ip.is_loopback())
            .find_map(|nic| {
                nic.broadcast_address().filter(|b| *b != nic.ip)
            })
            .ok_or(NetworkError::NoBroadcastInterface),
    }
}

/// Broadcast address of `interface`, or of the first suitable interface
pub fn broadcast_address(interface: Option<&str>) -> Result<Ipv4Addr, NetworkError> {
    let nics = list_ipv4()?;
    let address = choose_broadcast(&nics, interface)?;
    log::debug!(
        "Using broadcast address {} (interface {})",
        address,
        interface.unwrap_or("auto")
    );
    Ok(address)
}

// this will be common for all our UDP sockets
fn new_socket() -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;

    Ok(socket)
}

/// UDP socket on an ephemeral port that may send to broadcast addresses
pub fn create_broadcast_socket() -> io::Result<UdpSocket> {
    let socket = new_socket()?;
    socket.set_broadcast(true)?;

    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&socket2::SockAddr::from(addr))?;
    log::trace!("Binding broadcast socket to {}", addr);

    UdpSocket::from_std(socket.into())
}

/// TCP listener for the console to connect back to
pub fn create_session_listener(port: u16) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&socket2::SockAddr::from(addr))?;
    socket.listen(1)?;
    log::trace!("Listening for console sessions on {}", addr);

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic(name: &str, ip: [u8; 4], netmask: Option<[u8; 4]>, broadcast: Option<[u8; 4]>) -> NicV4 {
        NicV4 {
            name: name.to_string(),
            ip: Ipv4Addr::from(ip),
            netmask: netmask.map(Ipv4Addr::from),
            broadcast: broadcast.map(Ipv4Addr::from),
        }
    }

    #[test]
    fn test_broadcast_from_netmask() {
        let eth = nic("eth0", [192, 168, 1, 17], Some([255, 255, 255, 0]), None);
        assert_eq!(eth.broadcast_address(), Some(Ipv4Addr::new(192, 168, 1, 255)));

        let wide = nic("eth1", [10, 1, 2, 3], Some([255, 0, 0, 0]), None);
        assert_eq!(wide.broadcast_address(), Some(Ipv4Addr::new(10, 255, 255, 255)));
    }

    #[test]
    fn test_choose_broadcast() {
        let nics = vec![
            nic("lo", [127, 0, 0, 1], Some([255, 0, 0, 0]), None),
            nic("wg0", [10, 8, 0, 2], Some([255, 255, 255, 255]), None),
            nic("eth0", [192, 168, 1, 17], Some([255, 255, 255, 0]), Some([192, 168, 1, 255])),
        ];
        // Loopback and point-to-point links are skipped when choosing automatically
        assert_eq!(
            choose_broadcast(&nics, None).unwrap(),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            choose_broadcast(&nics, Some("lo")).unwrap(),
            Ipv4Addr::new(127, 255, 255, 255)
        );
        assert!(matches!(
            choose_broadcast(&nics, Some("eth9")),
            Err(NetworkError::InterfaceNotFound(_))
        ));
        assert!(matches!(
            choose_broadcast(&nics[..2], None),
            Err(NetworkError::NoBroadcastInterface)
        ));
    }

    #[tokio::test]
    async fn test_sockets_bind() {
        let socket = create_broadcast_socket().unwrap();
        assert!(socket.broadcast().unwrap());
        assert_ne!(socket.local_addr().unwrap().port(), 0);

        let listener = create_session_listener(0).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
