//! Master node: the root authority for configuration versions.
//!
//! Two channels:
//! - discovery, joined to the multicast group. Relays on the allow-list
//!   handshake and heartbeat here, and receive version stamps in reply.
//! - local, where operators announce a configuration change. Each change
//!   requests an out-of-schedule broadcast.
//!
//! All broadcasts, scheduled or requested, run on a single task so they
//! never interleave.

use super::{NodeTasks, Outbound, next_inbound, send_all};
use crate::node_id::NodeId;
use crate::peers::{PeerKey, PeerRegistry};
use crate::protocol::{Envelope, MessageType, VersionStamp};
use crate::providers::{AllowList, MembershipProvider, StaticVersions, VersionProvider};
use crate::schedule::{Clock, Schedule, SystemClock, Ticker};
use crate::transport::{Endpoint, Inbound};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Configuration for a master node.
#[derive(Debug, Clone)]
pub struct MasterNodeConfig {
    /// Multicast group relays listen on
    pub group: SocketAddr,
    /// Wait between scheduled broadcasts
    pub broadcast_interval: Duration,
    /// Silence after which a relay is dropped from the registry
    pub peer_expiry: Duration,
    /// Random extra delay added to each wait
    pub jitter: Option<Duration>,
}

impl Default for MasterNodeConfig {
    fn default() -> Self {
        Self {
            group: SocketAddr::from(([224, 0, 0, 1], 10000)),
            broadcast_interval: Duration::from_secs(3600),
            peer_expiry: Duration::from_secs(3600),
            jitter: None,
        }
    }
}

/// Collaborators a master calls out to.
#[derive(Clone)]
pub struct MasterContext {
    pub versions: Arc<dyn VersionProvider>,
    pub membership: Arc<dyn MembershipProvider>,
    pub clock: Arc<dyn Clock>,
}

impl Default for MasterContext {
    fn default() -> Self {
        Self {
            versions: Arc::new(StaticVersions::new()),
            membership: Arc::new(AllowList::default()),
            clock: Arc::new(SystemClock),
        }
    }
}

struct MasterInner {
    discovery: Endpoint,
    local: Endpoint,
    config: MasterNodeConfig,
    context: MasterContext,
    registry: PeerRegistry,
}

/// A running master node.
pub struct MasterNode {
    inner: Arc<MasterInner>,
    tasks: NodeTasks,
    trigger: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl MasterNode {
    pub fn new(
        discovery: Endpoint,
        local: Endpoint,
        config: MasterNodeConfig,
        context: MasterContext,
    ) -> Self {
        // Capacity 1: a request made while one is pending folds into it.
        let (trigger, trigger_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(MasterInner {
                discovery,
                local,
                config,
                context,
                registry: PeerRegistry::new(),
            }),
            tasks: NodeTasks::new(),
            trigger,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    pub fn identity(&self) -> &NodeId {
        self.inner.discovery.identity()
    }

    /// Registry of relays, keyed by IP.
    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    /// Decide the replies to one discovery datagram. Updates the registry.
    pub fn on_discovery(&self, inbound: &Inbound) -> Vec<Outbound> {
        self.inner.on_discovery(inbound)
    }

    /// Ask the broadcaster for an out-of-schedule broadcast.
    ///
    /// Returns false if a request is already pending, in which case this one
    /// is folded into it.
    pub fn request_broadcast(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }

    /// Spawn the discovery, local and broadcaster loops. No-op if already
    /// started.
    pub fn start(&self) {
        if !self.tasks.begin() {
            return;
        }
        let Some(mut trigger_rx) = self
            .trigger_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        info!(
            "Master {} starting on group {}",
            self.identity(),
            self.inner.config.group
        );

        let inner = self.inner.clone();
        let mut shutdown = self.tasks.subscribe();
        self.tasks.spawn(async move {
            while let Some(inbound) = next_inbound(&inner.discovery, &mut shutdown).await {
                let outbound = inner.on_discovery(&inbound);
                send_all(&inner.discovery, outbound).await;
            }
        });

        let inner = self.inner.clone();
        let trigger = self.trigger.clone();
        let mut shutdown = self.tasks.subscribe();
        self.tasks.spawn(async move {
            while let Some(inbound) = next_inbound(&inner.local, &mut shutdown).await {
                match inbound.envelope.kind {
                    MessageType::ConfigurationChange => {
                        info!("Configuration change announced by {}", inbound.source);
                        if trigger.try_send(()).is_err() {
                            debug!("Broadcast already pending");
                        }
                    }
                    other => debug!(
                        "Ignoring {:?} on config channel from {}",
                        other, inbound.source
                    ),
                }
            }
        });

        let inner = self.inner.clone();
        let mut shutdown = self.tasks.subscribe();
        self.tasks.spawn(async move {
            let schedule =
                Schedule::every(inner.config.broadcast_interval).with_jitter(inner.config.jitter);
            let mut ticker = Ticker::immediate(schedule);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                    Some(()) = trigger_rx.recv() => {}
                }
                inner.broadcast().await;
            }
        });
    }

    /// Stop all loops. Safe to call more than once.
    pub async fn close(&self) {
        if !self.tasks.mark_stopped() {
            return;
        }
        self.tasks.shutdown().await;
        info!("Master {} closed", self.identity());
    }
}

impl MasterInner {
    fn on_discovery(&self, inbound: &Inbound) -> Vec<Outbound> {
        let ip = inbound.source.ip();
        if !self.context.membership.is_member(&ip) {
            trace!("Ignoring {:?} from non-member {}", inbound.envelope.kind, ip);
            return Vec::new();
        }

        let key = PeerKey::host(ip);
        let envelope = &inbound.envelope;
        let reply = |e: Envelope| match &envelope.from {
            Some(from) => Outbound::new(inbound.source, e.addressed_to(from.clone())),
            None => Outbound::new(inbound.source, e),
        };

        match envelope.kind {
            MessageType::HandshakeRequest => {
                if self.registry.upsert(key, self.context.clock.now_ms()).is_new() {
                    info!("Relay {} joined", ip);
                }
                let mut out = vec![reply(Envelope::new(MessageType::HandshakeResponse))];
                out.extend(
                    self.context
                        .versions
                        .module_versions()
                        .iter()
                        .map(|stamp| reply(stamp_notice(stamp))),
                );
                out
            }
            MessageType::HeartbeatRequest => {
                self.registry.upsert(key, self.context.clock.now_ms());
                Vec::new()
            }
            MessageType::ConfigurationRequest => {
                self.registry.upsert(key, self.context.clock.now_ms());
                let stamps = match envelope.content_str("module") {
                    Some(module) => self.context.versions.section_versions(module),
                    None => self.context.versions.module_versions(),
                };
                stamps.iter().map(|stamp| reply(stamp_notice(stamp))).collect()
            }
            MessageType::ConnectionClose => {
                if self.registry.remove(&key).is_some() {
                    info!("Relay {} left", ip);
                }
                Vec::new()
            }
            MessageType::HandshakeResponse
            | MessageType::ConfigurationChange
            | MessageType::ConfigurationBroadcast
            | MessageType::HeartbeatResponse => {
                trace!("Ignoring {:?} from {}", envelope.kind, inbound.source);
                Vec::new()
            }
        }
    }

    /// Push every module stamp to the group, then sweep silent relays.
    async fn broadcast(&self) {
        let stamps = self.context.versions.module_versions();
        let outbound: Vec<Outbound> = stamps
            .iter()
            .map(|stamp| Outbound::new(self.config.group, stamp_notice(stamp)))
            .collect();
        let failed = send_all(&self.discovery, outbound).await;
        if failed > 0 {
            warn!("Broadcast: {} of {} stamp(s) failed to send", failed, stamps.len());
        } else {
            debug!("Broadcast {} stamp(s) to {}", stamps.len(), self.config.group);
        }

        let expired = self
            .registry
            .expire_older_than(self.config.peer_expiry, self.context.clock.now_ms());
        for peer in &expired {
            info!("Expired silent relay {:?}", peer.key);
        }
    }
}

fn stamp_notice(stamp: &VersionStamp) -> Envelope {
    Envelope::new(MessageType::ConfigurationBroadcast).with_content(stamp.to_content())
}
