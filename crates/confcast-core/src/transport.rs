//! DatagramChannel trait and the envelope-aware Endpoint on top of it.
//!
//! Implementations:
//! - UDP and multicast over tokio sockets (confcast-daemon)
//! - In-process network for tests ([`crate::memory`])

use crate::node_id::NodeId;
use crate::protocol::{DecodeError, Envelope, MAX_DATAGRAM_SIZE};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Channel closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Unreliable, unordered datagram socket.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// Send one datagram. Delivery is not guaranteed.
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()>;

    /// Wait for the next datagram (blocks until data available)
    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// A decoded envelope and the socket address it arrived from.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub envelope: Envelope,
    pub source: SocketAddr,
}

#[derive(Debug, Error)]
pub enum RecvError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Dropped datagram from {peer}: {error}")]
    Malformed { peer: SocketAddr, error: DecodeError },
}

/// A channel bound to the identity that stamps every outgoing envelope.
#[derive(Clone)]
pub struct Endpoint {
    identity: NodeId,
    channel: Arc<dyn DatagramChannel>,
}

impl Endpoint {
    pub fn new(identity: NodeId, channel: Arc<dyn DatagramChannel>) -> Self {
        Self { identity, channel }
    }

    pub fn identity(&self) -> &NodeId {
        &self.identity
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.channel.local_addr()
    }

    /// Encode with our identity as `from` and send to `target`.
    pub async fn send(&self, envelope: &Envelope, target: SocketAddr) -> Result<()> {
        let data = envelope.encode(&self.identity);
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::SendFailed(format!(
                "envelope is {} bytes, limit is {}",
                data.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        self.channel.send_to(&data, target).await
    }

    /// Receive and decode the next datagram.
    pub async fn recv(&self) -> std::result::Result<Inbound, RecvError> {
        let (data, source) = self.channel.recv_from().await?;
        let envelope = Envelope::decode(&data).map_err(|error| RecvError::Malformed {
            peer: source,
            error,
        })?;
        Ok(Inbound { envelope, source })
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("identity", &self.identity)
            .field("local_addr", &self.channel.local_addr().ok())
            .finish()
    }
}
