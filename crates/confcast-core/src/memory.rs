//! In-process datagram network for tests.
//!
//! Behaves like a lossless LAN: datagrams to a bound address are queued for
//! that socket, datagrams to a group address fan out to every member
//! (sender included, like multicast loopback), and anything else is
//! silently dropped. Send failures can be injected per target.

use crate::transport::{DatagramChannel, Result, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Debug, Default)]
struct NetworkState {
    sockets: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    groups: HashMap<SocketAddr, HashSet<SocketAddr>>,
    failing: HashSet<SocketAddr>,
}

/// Shared handle to an in-process network. Clones see the same sockets.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a socket. Fails if the address is already taken.
    pub fn bind(&self, addr: SocketAddr) -> Result<MemoryChannel> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.sockets.contains_key(&addr) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.sockets.insert(addr, tx);

        Ok(MemoryChannel {
            addr,
            network: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Subscribe `member` to datagrams sent to `group`.
    pub fn join(&self, group: SocketAddr, member: SocketAddr) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.groups.entry(group).or_default().insert(member);
    }

    /// Make every send to `target` fail until restored.
    pub fn fail_sends_to(&self, target: SocketAddr) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failing.insert(target);
    }

    pub fn restore_sends_to(&self, target: SocketAddr) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failing.remove(&target);
    }

    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sockets.contains_key(&addr)
    }

    fn deliver(&self, data: &[u8], from: SocketAddr, target: SocketAddr) -> Result<()> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.failing.contains(&target) {
            return Err(TransportError::SendFailed(format!("{target} unreachable")));
        }

        let recipients: Vec<SocketAddr> = match state.groups.get(&target) {
            Some(members) => members.iter().copied().collect(),
            None => vec![target],
        };

        for recipient in recipients {
            if let Some(tx) = state.sockets.get(&recipient) {
                // Receiver gone means the socket is closing; drop like UDP would.
                let _ = tx.send((data.to_vec(), from));
            }
        }
        Ok(())
    }

    fn unbind(&self, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sockets.remove(&addr);
        for members in state.groups.values_mut() {
            members.remove(&addr);
        }
    }
}

/// A socket on a [`MemoryNetwork`]. Unbinds on drop.
#[derive(Debug)]
pub struct MemoryChannel {
    addr: SocketAddr,
    network: MemoryNetwork,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl DatagramChannel for MemoryChannel {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.network.deliver(data, self.addr, target)
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr)> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.network.unbind(self.addr);
    }
}
