//! UDP transport
//!
//! Socket setup and the datagram send primitive shared by discovery,
//! lookup, and the inline transfer path. Uses socket2 for the options
//! plain `UdpSocket::bind` cannot express (broadcast, address reuse),
//! then hands the socket to tokio.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{NodeError, Result};
use crate::wire::Message;

/// Sending half of the unicast endpoint, cloned into every task that
/// needs to emit datagrams. `local` is the address advertised to peers,
/// which differs from the ephemeral source port a reply would see.
#[derive(Clone)]
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpEndpoint {
    pub fn new(socket: Arc<UdpSocket>, local: SocketAddr) -> Self {
        Self { socket, local }
    }

    /// The address this node advertises on the wire
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Shared handle to the underlying socket, for the receive loop
    pub fn socket_arc(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Send a control message to one peer
    pub async fn send(&self, msg: &Message, to: SocketAddr) -> Result<()> {
        self.send_bytes(msg.encode().as_bytes(), to).await
    }

    /// Send a raw datagram (inline chunk results carry binary)
    pub async fn send_bytes(&self, bytes: &[u8], to: SocketAddr) -> Result<()> {
        self.socket
            .send_to(bytes, to)
            .await
            .map_err(|e| NodeError::Io {
                path: Default::default(),
                message: format!("send to {}: {}", to, e),
            })?;
        Ok(())
    }
}

/// Bind the unicast socket at `addr` with broadcast sending enabled
/// (the bootstrap announcement goes to the broadcast address through
/// this socket).
pub fn bind_unicast(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NodeError::io_at("unicast socket", e))?;
    socket
        .set_broadcast(true)
        .map_err(|e| NodeError::io_at("unicast socket", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NodeError::io_at(format!("unicast bind {}", addr), e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NodeError::io_at("unicast socket", e))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| NodeError::io_at("unicast socket", e))
}

/// The local IP the OS would source traffic toward `target` from.
///
/// Nodes bound to the wildcard address cannot advertise it (peers would
/// reply into the void), so the routing table is asked instead: a UDP
/// connect assigns a local address without sending a packet.
pub fn routable_local_ip(target: SocketAddr) -> Result<IpAddr> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NodeError::io_at("route probe socket", e))?;
    socket
        .set_broadcast(true)
        .map_err(|e| NodeError::io_at("route probe socket", e))?;
    socket
        .connect(&target.into())
        .map_err(|e| NodeError::io_at(format!("route probe to {}", target), e))?;
    let local = socket
        .local_addr()
        .map_err(|e| NodeError::io_at("route probe socket", e))?
        .as_socket()
        .ok_or_else(|| NodeError::malformed("route probe yielded no address"))?;
    Ok(local.ip())
}

/// Bind the shared broadcast listener on `port`.
///
/// Address reuse is required so several nodes on one host (and one test
/// process) can all hear bootstrap announcements.
pub fn bind_broadcast(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NodeError::io_at("broadcast socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NodeError::io_at("broadcast socket", e))?;

    #[cfg(unix)]
    {
        socket
            .set_reuse_port(true)
            .map_err(|e| NodeError::io_at("broadcast socket", e))?;
    }

    socket
        .set_broadcast(true)
        .map_err(|e| NodeError::io_at("broadcast socket", e))?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| NodeError::io_at(format!("broadcast bind :{}", port), e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NodeError::io_at("broadcast socket", e))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| NodeError::io_at("broadcast socket", e))
}
