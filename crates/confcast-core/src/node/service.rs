//! Service node: a leaf agent attached to one relay.
//!
//! The protocol logic lives in [`ServiceSession`], a pure state machine that
//! says what to send next and how long to wait. [`ServiceNode`] drives it
//! over an [`Endpoint`]: one loop announces (handshake until answered, then
//! heartbeats), a second loop receives.

use super::{NodeTasks, next_inbound, sleep_or_shutdown};
use crate::node_id::NodeId;
use crate::protocol::{Content, Envelope, MessageType};
use crate::schedule::Schedule;
use crate::transport::{Endpoint, TransportError};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for a service node.
#[derive(Debug, Clone)]
pub struct ServiceNodeConfig {
    /// Wait between handshake attempts while unanswered
    pub handshake_interval: Duration,
    /// Wait between heartbeats once connected
    pub heartbeat_interval: Duration,
    /// Random extra delay added to each wait
    pub jitter: Option<Duration>,
}

impl Default for ServiceNodeConfig {
    fn default() -> Self {
        Self {
            handshake_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            jitter: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Disconnected,
    Handshaking,
    Connected,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// First handshake response received.
    Connected,
    HeartbeatAcknowledged,
    /// The relay reports new configuration. Pull it.
    ConfigurationChanged { content: Option<Content> },
}

/// Handshake/heartbeat state machine for one service node.
#[derive(Debug)]
pub struct ServiceSession {
    name: NodeId,
    state: ServiceState,
    handshake: Schedule,
    heartbeat: Schedule,
}

impl ServiceSession {
    pub fn new(name: NodeId, config: &ServiceNodeConfig) -> Self {
        Self {
            name,
            state: ServiceState::Disconnected,
            handshake: Schedule::every(config.handshake_interval).with_jitter(config.jitter),
            heartbeat: Schedule::every(config.heartbeat_interval).with_jitter(config.jitter),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// The next periodic envelope and how long to wait after sending it.
    pub fn announce(&mut self) -> (Envelope, Duration) {
        match self.state {
            ServiceState::Disconnected | ServiceState::Handshaking => {
                self.state = ServiceState::Handshaking;
                (
                    Envelope::named(MessageType::HandshakeRequest, &self.name),
                    self.handshake.delay(),
                )
            }
            ServiceState::Connected => (
                Envelope::named(MessageType::HeartbeatRequest, &self.name),
                self.heartbeat.delay(),
            ),
        }
    }

    /// Apply an inbound envelope.
    pub fn handle(&mut self, envelope: &Envelope) -> Option<ServiceEvent> {
        match envelope.kind {
            MessageType::HandshakeResponse => {
                if self.state == ServiceState::Connected {
                    return None;
                }
                self.state = ServiceState::Connected;
                Some(ServiceEvent::Connected)
            }
            MessageType::HeartbeatResponse => Some(ServiceEvent::HeartbeatAcknowledged),
            MessageType::ConfigurationChange => Some(ServiceEvent::ConfigurationChanged {
                content: envelope.content.clone(),
            }),
            MessageType::HandshakeRequest
            | MessageType::ConfigurationRequest
            | MessageType::ConfigurationBroadcast
            | MessageType::HeartbeatRequest
            | MessageType::ConnectionClose => None,
        }
    }

    pub fn farewell(&mut self) -> Envelope {
        self.state = ServiceState::Disconnected;
        Envelope::named(MessageType::ConnectionClose, &self.name)
    }

    pub fn configuration_request(&self) -> Envelope {
        Envelope::named(MessageType::ConfigurationRequest, &self.name)
    }
}

struct ServiceInner {
    endpoint: Endpoint,
    upstream: SocketAddr,
    session: Mutex<ServiceSession>,
    events: mpsc::UnboundedSender<ServiceEvent>,
}

/// A running service node.
pub struct ServiceNode {
    inner: Arc<ServiceInner>,
    tasks: NodeTasks,
}

impl ServiceNode {
    /// Create a node that talks to the relay at `upstream`.
    ///
    /// Returns the node and a receiver for its events. Nothing is sent until
    /// [`ServiceNode::start`].
    pub fn new(
        endpoint: Endpoint,
        upstream: SocketAddr,
        config: ServiceNodeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = ServiceSession::new(endpoint.identity().clone(), &config);
        let inner = Arc::new(ServiceInner {
            endpoint,
            upstream,
            session: Mutex::new(session),
            events,
        });
        (
            Self {
                inner,
                tasks: NodeTasks::new(),
            },
            events_rx,
        )
    }

    pub fn identity(&self) -> &NodeId {
        self.inner.endpoint.identity()
    }

    pub fn state(&self) -> ServiceState {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    /// Spawn the announce and receive loops. No-op if already started.
    pub fn start(&self) {
        if !self.tasks.begin() {
            return;
        }
        info!(
            "Service node {} starting, relay at {}",
            self.identity(),
            self.inner.upstream
        );

        let inner = self.inner.clone();
        let mut shutdown = self.tasks.subscribe();
        self.tasks.spawn(async move {
            loop {
                let (envelope, wait) = inner
                    .session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .announce();
                if let Err(e) = inner.endpoint.send(&envelope, inner.upstream).await {
                    warn!("Failed to send {:?} to {}: {}", envelope.kind, inner.upstream, e);
                }
                if sleep_or_shutdown(wait, &mut shutdown).await {
                    break;
                }
            }
        });

        let inner = self.inner.clone();
        let mut shutdown = self.tasks.subscribe();
        self.tasks.spawn(async move {
            while let Some(inbound) = next_inbound(&inner.endpoint, &mut shutdown).await {
                if inbound.source != inner.upstream {
                    debug!(
                        "Ignoring {:?} from {} (not our relay)",
                        inbound.envelope.kind, inbound.source
                    );
                    continue;
                }
                let event = inner
                    .session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handle(&inbound.envelope);
                let Some(event) = event else {
                    continue;
                };
                match &event {
                    ServiceEvent::Connected => info!("Connected to relay {}", inner.upstream),
                    ServiceEvent::HeartbeatAcknowledged => debug!("Heartbeat acknowledged"),
                    ServiceEvent::ConfigurationChanged { .. } => {
                        info!("Configuration changed upstream")
                    }
                }
                // Receiver dropped just means nobody is listening for events.
                let _ = inner.events.send(event);
            }
        });
    }

    /// Ask the relay to resend its configuration notice.
    pub async fn request_configuration(&self) -> Result<(), TransportError> {
        let envelope = self
            .inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .configuration_request();
        self.inner.endpoint.send(&envelope, self.inner.upstream).await
    }

    /// Say goodbye to the relay and stop all loops.
    ///
    /// Safe to call more than once; only the first call sends anything.
    pub async fn close(&self) {
        if !self.tasks.mark_stopped() {
            return;
        }
        let farewell = self
            .inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .farewell();
        if let Err(e) = self.inner.endpoint.send(&farewell, self.inner.upstream).await {
            warn!("Failed to send connection close to {}: {}", self.inner.upstream, e);
        }
        self.tasks.shutdown().await;
        info!("Service node {} closed", self.identity());
    }
}
