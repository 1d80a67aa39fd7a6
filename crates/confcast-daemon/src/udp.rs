//! UDP channels on tokio sockets.
//!
//! Unicast channels are a plain `bind`. Multicast channels go through socket2
//! so the port can be shared and the group joined before tokio takes over.

use async_trait::async_trait;
use confcast_core::protocol::MAX_DATAGRAM_SIZE;
use confcast_core::transport::{DatagramChannel, Result, TransportError};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::debug;

/// Multicast TTL. Packets may cross routers.
const MULTICAST_TTL: u32 = 255;

#[derive(Debug)]
pub struct UdpChannel {
    socket: UdpSocket,
}

impl UdpChannel {
    /// Bind a unicast socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("Bound UDP socket on {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    /// Bind `0.0.0.0:<group port>` with address reuse and join `group`.
    ///
    /// Loopback stays on so nodes on the same host hear each other. Must be
    /// called from within a tokio runtime.
    pub fn multicast(group: SocketAddr) -> io::Result<Self> {
        let SocketAddr::V4(group) = group else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("multicast group {group} is not IPv4"),
            ));
        };
        if !group.ip().is_multicast() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a multicast address", group.ip()),
            ));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port())).into())?;
        socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        socket.set_multicast_loop_v4(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        debug!("Joined multicast group {} on port {}", group.ip(), group.port());
        Ok(Self { socket })
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.socket
            .send_to(data, target)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(format!("{target}: {e}")))
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, source) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        buf.truncate(len);
        Ok((buf, source))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
