//! Slave node: relay between one master and many local service nodes.
//!
//! Upstream, the slave discovers a master over the multicast group, binds to
//! the first one that answers, and heartbeats it. Configuration notices from
//! the master trigger a pull followed by a best-effort fan-out to every
//! service node in the downstream registry.
//!
//! Downstream, the slave answers handshakes and heartbeats on its local
//! channel and keeps a registry keyed by each service node's socket address.

use super::{NodeTasks, Outbound, next_inbound, sleep_or_shutdown};
use crate::node_id::NodeId;
use crate::peers::{PeerKey, PeerRegistry};
use crate::protocol::{Content, Envelope, MessageType, VersionKind, VersionStamp};
use crate::providers::{ConfigurationPuller, MasterAddressStore, MemoryMasterStore, MemoryPuller};
use crate::schedule::{Clock, Schedule, SystemClock, Ticker};
use crate::transport::{Endpoint, Inbound};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Configuration for a slave node.
#[derive(Debug, Clone)]
pub struct SlaveNodeConfig {
    /// Multicast group the master listens on
    pub group: SocketAddr,
    /// Known master address. Skips discovery when set.
    pub master: Option<SocketAddr>,
    /// Wait between handshake broadcasts while no master is bound
    pub discovery_interval: Duration,
    /// Wait between heartbeats to the bound master
    pub heartbeat_interval: Duration,
    /// How often to sweep the downstream registry
    pub sweep_interval: Duration,
    /// Silence after which a service node is dropped
    pub peer_expiry: Duration,
    /// Random extra delay added to each wait
    pub jitter: Option<Duration>,
}

impl Default for SlaveNodeConfig {
    fn default() -> Self {
        Self {
            group: SocketAddr::from(([224, 0, 0, 1], 10000)),
            master: None,
            discovery_interval: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(3600),
            peer_expiry: Duration::from_secs(3600),
            jitter: None,
        }
    }
}

/// Collaborators a slave calls out to.
#[derive(Clone)]
pub struct SlaveContext {
    pub master_store: Arc<dyn MasterAddressStore>,
    pub puller: Arc<dyn ConfigurationPuller>,
    pub clock: Arc<dyn Clock>,
}

impl Default for SlaveContext {
    fn default() -> Self {
        Self {
            master_store: Arc::new(MemoryMasterStore::default()),
            puller: Arc::new(MemoryPuller::default()),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Result of a downstream fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

struct SlaveInner {
    upstream: Endpoint,
    local: Endpoint,
    config: SlaveNodeConfig,
    context: SlaveContext,
    master: OnceLock<SocketAddr>,
    registry: PeerRegistry,
    /// Last version acted on, per stamp
    known_versions: Mutex<HashMap<(VersionKind, String), String>>,
}

/// A running slave node.
pub struct SlaveNode {
    inner: Arc<SlaveInner>,
    tasks: NodeTasks,
}

impl SlaveNode {
    /// `upstream` is joined to the multicast group; `local` is where service
    /// nodes connect.
    pub fn new(
        upstream: Endpoint,
        local: Endpoint,
        config: SlaveNodeConfig,
        context: SlaveContext,
    ) -> Self {
        let master = OnceLock::new();
        if let Some(addr) = config.master {
            let _ = master.set(addr);
        }
        Self {
            inner: Arc::new(SlaveInner {
                upstream,
                local,
                config,
                context,
                master,
                registry: PeerRegistry::new(),
                known_versions: Mutex::new(HashMap::new()),
            }),
            tasks: NodeTasks::new(),
        }
    }

    pub fn identity(&self) -> &NodeId {
        self.inner.upstream.identity()
    }

    /// The bound master, if any.
    pub fn master(&self) -> Option<SocketAddr> {
        self.inner.master.get().copied()
    }

    /// Downstream registry of service nodes.
    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    /// Spawn the upstream, downstream and sweep loops. No-op if already
    /// started.
    pub fn start(&self) {
        if !self.tasks.begin() {
            return;
        }
        match self.master() {
            Some(master) => info!("Slave {} starting, master at {}", self.identity(), master),
            None => info!(
                "Slave {} starting, discovering master on {}",
                self.identity(),
                self.inner.config.group
            ),
        }

        let inner = self.inner.clone();
        let mut shutdown = self.tasks.subscribe();
        self.tasks.spawn(async move { inner.announce_loop(&mut shutdown).await });

        let inner = self.inner.clone();
        let mut shutdown = self.tasks.subscribe();
        self.tasks.spawn(async move {
            while let Some(inbound) = next_inbound(&inner.upstream, &mut shutdown).await {
                inner.on_upstream(inbound).await;
            }
        });

        let inner = self.inner.clone();
        let mut shutdown = self.tasks.subscribe();
        self.tasks.spawn(async move {
            while let Some(inbound) = next_inbound(&inner.local, &mut shutdown).await {
                if let Some(reply) = inner.on_local(inbound) {
                    if let Err(e) = inner.local.send(&reply.envelope, reply.target).await {
                        warn!(
                            "Failed to reply {:?} to {}: {}",
                            reply.envelope.kind, reply.target, e
                        );
                    }
                }
            }
        });

        let inner = self.inner.clone();
        let mut shutdown = self.tasks.subscribe();
        self.tasks.spawn(async move {
            let schedule =
                Schedule::every(inner.config.sweep_interval).with_jitter(inner.config.jitter);
            let mut ticker = Ticker::delayed(schedule);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => inner.sweep(),
                }
            }
        });
    }

    /// Send `CONFIGURATION_CHANGE` to every known service node.
    pub async fn notify_downstream(&self, content: Option<Content>) -> FanOut {
        self.inner.notify_downstream(content).await
    }

    /// Tell the master we are leaving and stop all loops.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        if !self.tasks.mark_stopped() {
            return;
        }
        if let Some(master) = self.master() {
            let envelope = Envelope::new(MessageType::ConnectionClose);
            if let Err(e) = self.inner.upstream.send(&envelope, master).await {
                warn!("Failed to send connection close to master {}: {}", master, e);
            }
        }
        self.tasks.shutdown().await;
        info!("Slave {} closed", self.identity());
    }
}

impl SlaveInner {
    async fn announce_loop(&self, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
        let discovery =
            Schedule::every(self.config.discovery_interval).with_jitter(self.config.jitter);
        let heartbeat =
            Schedule::every(self.config.heartbeat_interval).with_jitter(self.config.jitter);

        // A preconfigured master gets asked for its versions right away.
        if let Some(master) = self.master.get() {
            let request = Envelope::new(MessageType::ConfigurationRequest);
            if let Err(e) = self.upstream.send(&request, *master).await {
                warn!("Failed to request configuration from {}: {}", master, e);
            }
        }

        loop {
            let (envelope, target, wait) = match self.master.get() {
                None => (
                    Envelope::new(MessageType::HandshakeRequest),
                    self.config.group,
                    discovery.delay(),
                ),
                Some(master) => (
                    Envelope::new(MessageType::HeartbeatRequest),
                    *master,
                    heartbeat.delay(),
                ),
            };
            if let Err(e) = self.upstream.send(&envelope, target).await {
                warn!("Failed to send {:?} to {}: {}", envelope.kind, target, e);
            }
            if sleep_or_shutdown(wait, shutdown).await {
                break;
            }
        }
    }

    async fn on_upstream(&self, inbound: Inbound) {
        match inbound.envelope.kind {
            MessageType::HandshakeResponse => self.bind_master(inbound.source).await,
            MessageType::ConfigurationChange | MessageType::ConfigurationBroadcast => {
                self.on_configuration_notice(inbound).await
            }
            MessageType::HeartbeatResponse => {
                debug!("Heartbeat acknowledged by {}", inbound.source)
            }
            MessageType::ConnectionClose => {
                info!("Master {} announced shutdown", inbound.source)
            }
            // Other relays share the group; their requests are not for us.
            MessageType::HandshakeRequest
            | MessageType::ConfigurationRequest
            | MessageType::HeartbeatRequest => {
                trace!("Ignoring {:?} from {}", inbound.envelope.kind, inbound.source)
            }
        }
    }

    async fn bind_master(&self, source: SocketAddr) {
        match self.master.set(source) {
            Ok(()) => {
                info!("Bound to master {}", source);
                // Stores may hit the disk; keep that off the receive loop.
                let store = self.context.master_store.clone();
                let saved =
                    tokio::task::spawn_blocking(move || store.save_master_address(source)).await;
                match saved {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to persist master address {}: {}", source, e),
                    Err(e) => warn!("Master address store task failed: {}", e),
                }
            }
            Err(_) => {
                if self.master.get() != Some(&source) {
                    debug!("Ignoring handshake response from {} (already bound)", source);
                }
            }
        }
    }

    async fn on_configuration_notice(&self, inbound: Inbound) {
        let source = inbound.source;
        let master = match self.master.get() {
            Some(master) if master.ip() != source.ip() => {
                debug!("Ignoring configuration notice from {} (bound to {})", source, master);
                return;
            }
            Some(master) => *master,
            None => source,
        };

        let stamp = inbound
            .envelope
            .content
            .as_ref()
            .and_then(VersionStamp::from_content);

        // Known stamps skip the pull but are still fanned out, so a
        // re-broadcast reaches services that missed the first notice.
        let known = stamp.as_ref().is_some_and(|stamp| {
            self.known_versions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&(stamp.kind, stamp.name.clone()))
                == Some(&stamp.version)
        });

        if !known {
            if let Err(e) = self.context.puller.pull(master, stamp.as_ref()).await {
                warn!("Failed to pull configuration from {}: {}", master, e);
                return;
            }
            if let Some(stamp) = &stamp {
                self.known_versions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert((stamp.kind, stamp.name.clone()), stamp.version.clone());
            }
        }

        let fan_out = self
            .notify_downstream(stamp.as_ref().map(VersionStamp::to_content))
            .await;
        match &stamp {
            Some(stamp) if known => debug!(
                "Already at {} version {}, re-notified {} service node(s) ({} failed)",
                stamp.name, stamp.version, fan_out.delivered, fan_out.failed
            ),
            Some(stamp) => info!(
                "Applied {} version {}, notified {} service node(s) ({} failed)",
                stamp.name, stamp.version, fan_out.delivered, fan_out.failed
            ),
            None => info!(
                "Configuration changed, notified {} service node(s) ({} failed)",
                fan_out.delivered, fan_out.failed
            ),
        }
    }

    /// Handle one datagram from a service node, returning the reply if any.
    fn on_local(&self, inbound: Inbound) -> Option<Outbound> {
        let Inbound { envelope, source } = inbound;
        let key = PeerKey::endpoint(source);

        if envelope.kind == MessageType::ConnectionClose {
            if self.registry.remove(&key).is_some() {
                info!("Service node {} left", source);
            }
            return None;
        }

        if self.registry.upsert(key, self.context.clock.now_ms()).is_new() {
            info!("Service node {} joined", source);
        }

        let reply = match envelope.kind {
            MessageType::HandshakeRequest => Envelope::new(MessageType::HandshakeResponse),
            MessageType::HeartbeatRequest => Envelope::new(MessageType::HeartbeatResponse),
            MessageType::ConfigurationRequest => Envelope::new(MessageType::ConfigurationChange),
            MessageType::HandshakeResponse
            | MessageType::ConfigurationChange
            | MessageType::ConfigurationBroadcast
            | MessageType::HeartbeatResponse
            | MessageType::ConnectionClose => {
                debug!("Unexpected {:?} from service node {}", envelope.kind, source);
                return None;
            }
        };

        let reply = match envelope.from {
            Some(from) => reply.addressed_to(from),
            None => reply,
        };
        Some(Outbound::new(source, reply))
    }

    async fn notify_downstream(&self, content: Option<Content>) -> FanOut {
        let mut envelope = Envelope::new(MessageType::ConfigurationChange);
        envelope.content = content;

        let mut fan_out = FanOut::default();
        for peer in self.registry.list() {
            let Some(target) = peer.key.socket_addr() else {
                continue;
            };
            match self.local.send(&envelope, target).await {
                Ok(()) => fan_out.delivered += 1,
                Err(e) => {
                    warn!("Failed to notify service node {}: {}", target, e);
                    fan_out.failed += 1;
                }
            }
        }
        fan_out
    }

    fn sweep(&self) {
        let expired = self
            .registry
            .expire_older_than(self.config.peer_expiry, self.context.clock.now_ms());
        for peer in &expired {
            info!("Expired silent service node {:?}", peer.key);
        }
    }
}
