//! Node roles: service (leaf), slave (relay) and master (root).
//!
//! Each role owns its endpoints, registry and timers, and runs as a handful of
//! tokio tasks sharing one `Arc` of role state. Stopping a role flips a watch
//! channel every loop selects on, then joins the tasks.

pub mod master;
pub mod service;
pub mod slave;

use crate::protocol::Envelope;
use crate::transport::{Endpoint, Inbound, RecvError, TransportError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// A datagram a role wants sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub target: SocketAddr,
    pub envelope: Envelope,
}

impl Outbound {
    pub fn new(target: SocketAddr, envelope: Envelope) -> Self {
        Self { target, envelope }
    }
}

/// Lifecycle of the tasks behind one role instance.
///
/// A role starts at most once and stops at most once.
#[derive(Debug)]
pub(crate) struct NodeTasks {
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeTasks {
    pub(crate) fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Returns false if the role was already started or has been stopped.
    pub(crate) fn begin(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.started.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Claim the stop transition. Only the first caller on a started role
    /// gets `true`.
    pub(crate) fn mark_stopped(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.swap(true, Ordering::SeqCst)
    }

    /// Signal every loop and wait for it to exit.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("Node task panicked: {}", e);
                }
            }
        }
    }
}

/// Sleep for `delay` unless shutdown fires first. Returns true on shutdown.
pub(crate) async fn sleep_or_shutdown(
    delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

/// Next envelope this endpoint should act on, or `None` once the loop should
/// end.
///
/// Malformed datagrams and transient transport errors are logged and
/// skipped. Our own datagrams and envelopes addressed to other nodes are
/// filtered out here.
pub(crate) async fn next_inbound(
    endpoint: &Endpoint,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Inbound> {
    loop {
        if *shutdown.borrow() {
            return None;
        }
        let result = tokio::select! {
            _ = shutdown.changed() => return None,
            result = endpoint.recv() => result,
        };
        match result {
            Ok(inbound) => {
                if inbound.envelope.is_addressed_to(endpoint.identity()) {
                    return Some(inbound);
                }
                trace!(
                    "Ignoring {:?} from {} (not for {})",
                    inbound.envelope.kind,
                    inbound.source,
                    endpoint.identity()
                );
            }
            Err(RecvError::Transport(TransportError::Closed)) => return None,
            Err(e) => warn!("{}", e),
        }
    }
}

/// Send each outbound envelope, logging failures without stopping.
///
/// Returns the number that failed.
pub(crate) async fn send_all(endpoint: &Endpoint, outbound: Vec<Outbound>) -> usize {
    let mut failed = 0;
    for Outbound { target, envelope } in outbound {
        if let Err(e) = endpoint.send(&envelope, target).await {
            warn!("Failed to send {:?} to {}: {}", envelope.kind, target, e);
            failed += 1;
        }
    }
    failed
}
