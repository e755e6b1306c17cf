//! Mock Overlay Peer for Testing
//!
//! A scripted UDP endpoint speaking the overlay's wire format, used to
//! drive a real node through exact message sequences without a second
//! full node on the other end.

use shoal::wire::Message;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub struct MockPeer {
    socket: UdpSocket,
    addr: SocketAddr,
}

impl MockPeer {
    /// Bind on an ephemeral loopback port.
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock peer");
        let addr = socket.local_addr().expect("no local addr");
        Self { socket, addr }
    }

    /// Address this peer would be known by in the overlay.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one control message to a node.
    pub async fn send(&self, msg: &Message, to: SocketAddr) {
        self.socket
            .send_to(msg.encode().as_bytes(), to)
            .await
            .expect("mock peer send failed");
    }

    /// Receive and decode the next control message, if one arrives
    /// before the deadline.
    pub async fn recv(&self, deadline: Duration) -> Option<(Message, SocketAddr)> {
        let (bytes, from) = self.recv_raw(deadline).await?;
        let text = std::str::from_utf8(&bytes).expect("mock peer got non-utf8 datagram");
        Some((Message::decode(text).expect("mock peer got malformed message"), from))
    }

    /// Receive the next raw datagram (inline chunk results are binary).
    pub async fn recv_raw(&self, deadline: Duration) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; 16 * 1024];
        match timeout(deadline, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                buf.truncate(len);
                Some((buf, from))
            }
            _ => None,
        }
    }
}
