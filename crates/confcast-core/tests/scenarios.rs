//! Scenario tests for the three node roles.
//!
//! Every node runs on an in-process `MemoryNetwork` under a paused tokio
//! clock, so hour-long timers resolve instantly. Probes are bare endpoints
//! that stand in for a peer and let the test see the raw envelopes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use confcast_core::providers::{AllowList, MemoryMasterStore, MemoryPuller, StaticVersions};
use confcast_core::{
    Envelope, FanOut, Inbound, ManualClock, MasterContext, MasterNode, MasterNodeConfig,
    MemoryNetwork, MessageType, NodeId, PeerKey, ServiceEvent, ServiceNode, ServiceNodeConfig,
    ServiceState, SlaveContext, SlaveNode, SlaveNodeConfig, VersionStamp,
};
use confcast_core::transport::Endpoint;
use tokio::sync::mpsc;
use tokio::time::timeout;

const GROUP: ([u8; 4], u16) = ([224, 0, 0, 1], 10000);
const MASTER_IP: [u8; 4] = [10, 0, 0, 1];
const SLAVE_IP: [u8; 4] = [10, 0, 0, 2];

fn group() -> SocketAddr {
    SocketAddr::from(GROUP)
}

fn addr(ip: [u8; 4], port: u16) -> SocketAddr {
    SocketAddr::from((ip, port))
}

fn id(name: &str) -> NodeId {
    name.parse().unwrap()
}

fn endpoint(net: &MemoryNetwork, name: &str, at: SocketAddr) -> Endpoint {
    Endpoint::new(id(name), Arc::new(net.bind(at).unwrap()))
}

/// A bare endpoint the test drives by hand.
struct Probe {
    endpoint: Endpoint,
}

impl Probe {
    fn new(net: &MemoryNetwork, name: &str, at: SocketAddr) -> Self {
        Self {
            endpoint: endpoint(net, name, at),
        }
    }

    fn joined(net: &MemoryNetwork, name: &str, at: SocketAddr) -> Self {
        let probe = Self::new(net, name, at);
        net.join(group(), at);
        probe
    }

    async fn send(&self, envelope: Envelope, target: SocketAddr) {
        self.endpoint.send(&envelope, target).await.unwrap();
    }

    /// Next envelope of `kind` meant for this probe, skipping everything else.
    async fn expect(&self, kind: MessageType) -> Inbound {
        timeout(Duration::from_secs(600), async {
            loop {
                let inbound = self.endpoint.recv().await.unwrap();
                if inbound.envelope.kind == kind
                    && inbound.envelope.is_addressed_to(self.endpoint.identity())
                {
                    return inbound;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", kind))
    }

    /// Everything of `kind` received within `window`.
    async fn collect(&self, kind: MessageType, window: Duration) -> Vec<Inbound> {
        let mut seen = Vec::new();
        let _ = timeout(window, async {
            loop {
                let inbound = self.endpoint.recv().await.unwrap();
                if inbound.envelope.kind == kind {
                    seen.push(inbound);
                }
            }
        })
        .await;
        seen
    }
}

/// Poll `check` until it holds, letting paused time move forward.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..6000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition never held: {}", what);
}

fn stamp_of(inbound: &Inbound) -> Option<VersionStamp> {
    inbound
        .envelope
        .content
        .as_ref()
        .and_then(VersionStamp::from_content)
}

fn versions() -> Arc<StaticVersions> {
    let versions = StaticVersions::new();
    versions.set_module("auth", "1", &[("ttl", "4")]);
    versions.set_module("db", "7", &[]);
    Arc::new(versions)
}

struct MasterHarness {
    node: MasterNode,
    clock: Arc<ManualClock>,
}

fn start_master(net: &MemoryNetwork, members: &[[u8; 4]]) -> MasterHarness {
    let discovery_addr = addr(MASTER_IP, 10000);
    let discovery = endpoint(net, "master", discovery_addr);
    net.join(group(), discovery_addr);
    let local = endpoint(net, "master", addr(MASTER_IP, 10001));

    let clock = Arc::new(ManualClock::new(1_000_000));
    let node = MasterNode::new(
        discovery,
        local,
        MasterNodeConfig::default(),
        MasterContext {
            versions: versions(),
            membership: Arc::new(AllowList::new(members.iter().map(|ip| IpAddr::from(*ip)))),
            clock: clock.clone(),
        },
    );
    node.start();
    MasterHarness { node, clock }
}

struct SlaveHarness {
    node: SlaveNode,
    store: Arc<MemoryMasterStore>,
    puller: Arc<MemoryPuller>,
    clock: Arc<ManualClock>,
}

fn slave(net: &MemoryNetwork, config: SlaveNodeConfig) -> SlaveHarness {
    let upstream_addr = addr(SLAVE_IP, 10000);
    let upstream = endpoint(net, "relay", upstream_addr);
    net.join(group(), upstream_addr);
    let local = endpoint(net, "relay", addr(SLAVE_IP, 10002));

    let store = Arc::new(MemoryMasterStore::default());
    let puller = Arc::new(MemoryPuller::default());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let node = SlaveNode::new(
        upstream,
        local,
        config,
        SlaveContext {
            master_store: store.clone(),
            puller: puller.clone(),
            clock: clock.clone(),
        },
    );
    SlaveHarness {
        node,
        store,
        puller,
        clock,
    }
}

fn service(
    net: &MemoryNetwork,
    name: &str,
    port: u16,
) -> (ServiceNode, mpsc::UnboundedReceiver<ServiceEvent>) {
    ServiceNode::new(
        endpoint(net, name, addr(SLAVE_IP, port)),
        addr(SLAVE_IP, 10002),
        ServiceNodeConfig::default(),
    )
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServiceEvent>) -> ServiceEvent {
    timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("timed out waiting for service event")
        .expect("event channel closed")
}

// ==================== Service <-> slave ====================

#[tokio::test(start_paused = true)]
async fn test_service_handshake_then_heartbeat() {
    let net = MemoryNetwork::new();
    let relay = slave(&net, SlaveNodeConfig::default());
    relay.node.start();

    let (svc, mut events) = service(&net, "svc-1", 4000);
    svc.start();

    assert_eq!(next_event(&mut events).await, ServiceEvent::Connected);
    assert_eq!(svc.state(), ServiceState::Connected);
    assert!(
        relay
            .node
            .registry()
            .contains(&PeerKey::endpoint(addr(SLAVE_IP, 4000)))
    );

    assert_eq!(next_event(&mut events).await, ServiceEvent::HeartbeatAcknowledged);

    svc.close().await;
    relay.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_service_heartbeat_refreshes_registry() {
    let net = MemoryNetwork::new();
    let relay = slave(&net, SlaveNodeConfig::default());
    relay.node.start();

    let (svc, mut events) = service(&net, "svc-1", 4000);
    svc.start();
    assert_eq!(next_event(&mut events).await, ServiceEvent::Connected);

    relay.clock.advance(Duration::from_secs(30));
    assert_eq!(next_event(&mut events).await, ServiceEvent::HeartbeatAcknowledged);

    let record = relay
        .node
        .registry()
        .get(&PeerKey::endpoint(addr(SLAVE_IP, 4000)))
        .unwrap();
    assert_eq!(record.connected_at_ms, 1_000_000);
    assert_eq!(record.last_heartbeat_ms, 1_030_000);

    svc.close().await;
    relay.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_service_close_removes_from_registry() {
    let net = MemoryNetwork::new();
    let relay = slave(&net, SlaveNodeConfig::default());
    relay.node.start();

    let (svc, mut events) = service(&net, "svc-1", 4000);
    svc.start();
    assert_eq!(next_event(&mut events).await, ServiceEvent::Connected);

    svc.close().await;
    eventually("registry emptied", || relay.node.registry().is_empty()).await;
    assert_eq!(svc.state(), ServiceState::Disconnected);

    relay.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_service_close_is_idempotent() {
    let net = MemoryNetwork::new();
    let fake_relay = Probe::new(&net, "relay", addr(SLAVE_IP, 10002));

    let (svc, _events) = service(&net, "svc-1", 4000);
    svc.start();
    fake_relay.expect(MessageType::HandshakeRequest).await;

    svc.close().await;
    svc.close().await;
    assert!(!svc.is_running());

    let closes = fake_relay
        .collect(MessageType::ConnectionClose, Duration::from_secs(60))
        .await;
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].envelope.content_str("name"), Some("svc-1"));
}

#[tokio::test(start_paused = true)]
async fn test_service_keeps_handshaking_without_relay() {
    let net = MemoryNetwork::new();
    let fake_relay = Probe::new(&net, "relay", addr(SLAVE_IP, 10002));

    let (svc, _events) = service(&net, "svc-1", 4000);
    svc.start();

    let handshakes = fake_relay
        .collect(MessageType::HandshakeRequest, Duration::from_secs(35))
        .await;
    assert_eq!(handshakes.len(), 4);
    assert_eq!(svc.state(), ServiceState::Handshaking);

    svc.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_service_configuration_request_answered() {
    let net = MemoryNetwork::new();
    let relay = slave(&net, SlaveNodeConfig::default());
    relay.node.start();

    let (svc, mut events) = service(&net, "svc-1", 4000);
    svc.start();
    assert_eq!(next_event(&mut events).await, ServiceEvent::Connected);

    svc.request_configuration().await.unwrap();
    loop {
        match next_event(&mut events).await {
            ServiceEvent::ConfigurationChanged { content } => {
                assert_eq!(content, None);
                break;
            }
            ServiceEvent::HeartbeatAcknowledged => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }

    svc.close().await;
    relay.node.close().await;
}

// ==================== Master discovery ====================

#[tokio::test(start_paused = true)]
async fn test_master_handshake_reply_and_stamps() {
    let net = MemoryNetwork::new();
    let master = start_master(&net, &[[10, 0, 0, 3]]);
    let relay = Probe::new(&net, "relay-probe", addr([10, 0, 0, 3], 10000));

    relay
        .send(
            Envelope::new(MessageType::HandshakeRequest),
            addr(MASTER_IP, 10000),
        )
        .await;

    let response = relay.expect(MessageType::HandshakeResponse).await;
    assert_eq!(response.source, addr(MASTER_IP, 10000));
    assert_eq!(response.envelope.to, Some(id("relay-probe")));

    let first = relay.expect(MessageType::ConfigurationBroadcast).await;
    let second = relay.expect(MessageType::ConfigurationBroadcast).await;
    assert_eq!(stamp_of(&first), Some(VersionStamp::section("auth", "1")));
    assert_eq!(stamp_of(&second), Some(VersionStamp::section("db", "7")));
    assert_eq!(first.envelope.to, Some(id("relay-probe")));

    assert!(
        master
            .node
            .registry()
            .contains(&PeerKey::host(IpAddr::from([10, 0, 0, 3])))
    );
    master.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_master_ignores_non_member() {
    let net = MemoryNetwork::new();
    let master = start_master(&net, &[[10, 0, 0, 3]]);
    let stranger = Probe::new(&net, "stranger", addr([10, 0, 0, 9], 10000));

    stranger
        .send(
            Envelope::new(MessageType::HandshakeRequest),
            addr(MASTER_IP, 10000),
        )
        .await;

    let replies = stranger
        .collect(MessageType::HandshakeResponse, Duration::from_secs(30))
        .await;
    assert!(replies.is_empty());
    assert!(master.node.registry().is_empty());
    master.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_master_broadcasts_on_start_and_on_change() {
    let net = MemoryNetwork::new();
    let listener = Probe::joined(&net, "listener", addr([10, 0, 0, 5], 10000));
    let master = start_master(&net, &[]);

    let initial = listener
        .collect(MessageType::ConfigurationBroadcast, Duration::from_secs(10))
        .await;
    assert_eq!(initial.len(), 2);
    assert!(initial.iter().all(|i| i.envelope.to.is_none()));

    let operator = Probe::new(&net, "operator", addr(MASTER_IP, 5000));
    operator
        .send(
            Envelope::new(MessageType::ConfigurationChange),
            addr(MASTER_IP, 10001),
        )
        .await;

    let triggered = listener
        .collect(MessageType::ConfigurationBroadcast, Duration::from_secs(10))
        .await;
    assert_eq!(triggered.len(), 2);
    master.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_master_periodic_broadcast() {
    let net = MemoryNetwork::new();
    let listener = Probe::joined(&net, "listener", addr([10, 0, 0, 5], 10000));
    let master = start_master(&net, &[]);

    let hour = listener
        .collect(MessageType::ConfigurationBroadcast, Duration::from_secs(3601))
        .await;
    assert_eq!(hour.len(), 4);
    master.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_master_sweeps_silent_relays() {
    let net = MemoryNetwork::new();
    let master = start_master(&net, &[[10, 0, 0, 3]]);
    let relay = Probe::new(&net, "relay-probe", addr([10, 0, 0, 3], 10000));

    relay
        .send(
            Envelope::new(MessageType::HandshakeRequest),
            addr(MASTER_IP, 10000),
        )
        .await;
    relay.expect(MessageType::HandshakeResponse).await;
    assert_eq!(master.node.registry().len(), 1);

    master.clock.advance(Duration::from_secs(3601));
    assert!(master.node.request_broadcast());
    eventually("relay expired", || master.node.registry().is_empty()).await;
    master.node.close().await;
}

// ==================== Slave upstream ====================

#[tokio::test(start_paused = true)]
async fn test_slave_binds_master_and_pulls() {
    let net = MemoryNetwork::new();
    let master = start_master(&net, &[SLAVE_IP]);
    let relay = slave(&net, SlaveNodeConfig::default());
    relay.node.start();

    eventually("master bound", || relay.node.master().is_some()).await;
    assert_eq!(relay.node.master(), Some(addr(MASTER_IP, 10000)));
    assert_eq!(relay.store.saved(), vec![addr(MASTER_IP, 10000)]);
    assert!(
        master
            .node
            .registry()
            .contains(&PeerKey::host(IpAddr::from(SLAVE_IP)))
    );

    eventually("both modules pulled", || relay.puller.pulls().len() >= 2).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    let pulled: Vec<Option<VersionStamp>> =
        relay.puller.pulls().into_iter().map(|(_, s)| s).collect();
    assert_eq!(pulled.len(), 2, "repeat notices for known versions are skipped");
    assert!(pulled.contains(&Some(VersionStamp::section("auth", "1"))));
    assert!(pulled.contains(&Some(VersionStamp::section("db", "7"))));

    relay.node.close().await;
    master.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_slave_binds_first_responder() {
    let net = MemoryNetwork::new();
    let first = Probe::joined(&net, "master-a", addr([10, 0, 0, 1], 10000));
    let second = Probe::joined(&net, "master-b", addr([10, 0, 0, 7], 10000));
    let relay = slave(&net, SlaveNodeConfig::default());
    relay.node.start();

    let handshake = first.expect(MessageType::HandshakeRequest).await;
    second.expect(MessageType::HandshakeRequest).await;

    first
        .send(
            Envelope::new(MessageType::HandshakeResponse).addressed_to(id("relay")),
            handshake.source,
        )
        .await;
    eventually("bound", || relay.node.master().is_some()).await;
    second
        .send(
            Envelope::new(MessageType::HandshakeResponse).addressed_to(id("relay")),
            handshake.source,
        )
        .await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(relay.node.master(), Some(addr([10, 0, 0, 1], 10000)));
    assert_eq!(relay.store.saved(), vec![addr([10, 0, 0, 1], 10000)]);

    // Notices from the loser are dropped; the bound master's go through.
    second
        .send(
            Envelope::new(MessageType::ConfigurationBroadcast)
                .with_content(VersionStamp::section("db", "9").to_content()),
            handshake.source,
        )
        .await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(relay.puller.pulls().is_empty());

    first
        .send(
            Envelope::new(MessageType::ConfigurationBroadcast)
                .with_content(VersionStamp::section("db", "9").to_content()),
            handshake.source,
        )
        .await;
    eventually("pulled", || relay.puller.pulls().len() == 1).await;
    assert_eq!(relay.puller.pulls()[0].0, addr([10, 0, 0, 1], 10000));

    // Heartbeats now go to the bound master only.
    first.expect(MessageType::HeartbeatRequest).await;

    relay.node.close().await;
    let close = first.expect(MessageType::ConnectionClose).await;
    assert_eq!(close.source, handshake.source);
}

#[tokio::test(start_paused = true)]
async fn test_slave_ignores_response_addressed_elsewhere() {
    let net = MemoryNetwork::new();
    let fake_master = Probe::joined(&net, "master", addr(MASTER_IP, 10000));
    let relay = slave(&net, SlaveNodeConfig::default());
    relay.node.start();

    let handshake = fake_master.expect(MessageType::HandshakeRequest).await;
    fake_master
        .send(
            Envelope::new(MessageType::HandshakeResponse).addressed_to(id("other-relay")),
            handshake.source,
        )
        .await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(relay.node.master(), None);
    relay.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_preconfigured_slave_requests_configuration() {
    let net = MemoryNetwork::new();
    let fake_master = Probe::new(&net, "master", addr(MASTER_IP, 10000));
    let relay = slave(
        &net,
        SlaveNodeConfig {
            master: Some(addr(MASTER_IP, 10000)),
            ..SlaveNodeConfig::default()
        },
    );
    relay.node.start();

    fake_master.expect(MessageType::ConfigurationRequest).await;
    fake_master.expect(MessageType::HeartbeatRequest).await;
    assert!(relay.store.saved().is_empty());

    relay.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_pull_skips_notify_and_retries() {
    let net = MemoryNetwork::new();
    let fake_master = Probe::new(&net, "master", addr(MASTER_IP, 10000));
    let relay = slave(
        &net,
        SlaveNodeConfig {
            master: Some(addr(MASTER_IP, 10000)),
            ..SlaveNodeConfig::default()
        },
    );
    relay.node.start();
    let downstream = Probe::new(&net, "svc-1", addr(SLAVE_IP, 4000));
    downstream
        .send(
            Envelope::new(MessageType::HandshakeRequest),
            addr(SLAVE_IP, 10002),
        )
        .await;
    downstream.expect(MessageType::HandshakeResponse).await;

    let notice = || {
        Envelope::new(MessageType::ConfigurationChange)
            .with_content(VersionStamp::section("db", "8").to_content())
    };

    relay.puller.set_failing(true);
    fake_master.send(notice(), addr(SLAVE_IP, 10000)).await;
    let during_failure = downstream
        .collect(MessageType::ConfigurationChange, Duration::from_secs(5))
        .await;
    assert!(during_failure.is_empty());

    relay.puller.set_failing(false);
    fake_master.send(notice(), addr(SLAVE_IP, 10000)).await;
    let change = downstream.expect(MessageType::ConfigurationChange).await;
    assert_eq!(stamp_of(&change), Some(VersionStamp::section("db", "8")));
    assert_eq!(relay.puller.pulls().len(), 2);

    relay.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_rebroadcast_repairs_lost_notice() {
    let net = MemoryNetwork::new();
    let fake_master = Probe::new(&net, "master", addr(MASTER_IP, 10000));
    let relay = slave(
        &net,
        SlaveNodeConfig {
            master: Some(addr(MASTER_IP, 10000)),
            ..SlaveNodeConfig::default()
        },
    );
    relay.node.start();
    let downstream = Probe::new(&net, "svc-1", addr(SLAVE_IP, 4000));
    downstream
        .send(
            Envelope::new(MessageType::HandshakeRequest),
            addr(SLAVE_IP, 10002),
        )
        .await;
    downstream.expect(MessageType::HandshakeResponse).await;

    let broadcast = || {
        Envelope::new(MessageType::ConfigurationBroadcast)
            .with_content(VersionStamp::section("db", "8").to_content())
    };

    net.fail_sends_to(addr(SLAVE_IP, 4000));
    fake_master.send(broadcast(), addr(SLAVE_IP, 10000)).await;
    eventually("pulled", || relay.puller.pulls().len() == 1).await;
    let lost = downstream
        .collect(MessageType::ConfigurationChange, Duration::from_secs(5))
        .await;
    assert!(lost.is_empty());
    net.restore_sends_to(addr(SLAVE_IP, 4000));

    // Same stamp again, as the next scheduled broadcast would carry it.
    fake_master.send(broadcast(), addr(SLAVE_IP, 10000)).await;
    let change = downstream.expect(MessageType::ConfigurationChange).await;
    assert_eq!(stamp_of(&change), Some(VersionStamp::section("db", "8")));
    assert_eq!(relay.puller.pulls().len(), 1, "known stamp is not pulled twice");

    relay.node.close().await;
}

// ==================== Slave downstream fan-out ====================

#[tokio::test(start_paused = true)]
async fn test_fan_out_survives_failed_send() {
    let net = MemoryNetwork::new();
    let relay = slave(&net, SlaveNodeConfig::default());
    relay.node.start();

    let services: Vec<Probe> = (0..3)
        .map(|i| Probe::new(&net, &format!("svc-{i}"), addr(SLAVE_IP, 4000 + i)))
        .collect();
    for probe in &services {
        probe
            .send(
                Envelope::new(MessageType::HandshakeRequest),
                addr(SLAVE_IP, 10002),
            )
            .await;
        probe.expect(MessageType::HandshakeResponse).await;
    }
    assert_eq!(relay.node.registry().len(), 3);

    net.fail_sends_to(addr(SLAVE_IP, 4001));
    let fan_out = relay.node.notify_downstream(None).await;
    assert_eq!(
        fan_out,
        FanOut {
            delivered: 2,
            failed: 1
        }
    );

    services[0].expect(MessageType::ConfigurationChange).await;
    services[2].expect(MessageType::ConfigurationChange).await;
    assert_eq!(relay.node.registry().len(), 3);

    relay.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_upstream_change_reaches_all_services() {
    let net = MemoryNetwork::new();
    let fake_master = Probe::new(&net, "master", addr(MASTER_IP, 10000));
    let relay = slave(&net, SlaveNodeConfig::default());
    relay.node.start();

    let (svc_a, mut events_a) = service(&net, "svc-a", 4000);
    let (svc_b, mut events_b) = service(&net, "svc-b", 4001);
    svc_a.start();
    svc_b.start();
    assert_eq!(next_event(&mut events_a).await, ServiceEvent::Connected);
    assert_eq!(next_event(&mut events_b).await, ServiceEvent::Connected);

    fake_master
        .send(
            Envelope::new(MessageType::ConfigurationBroadcast)
                .with_content(VersionStamp::section("auth", "2").to_content()),
            addr(SLAVE_IP, 10000),
        )
        .await;

    for events in [&mut events_a, &mut events_b] {
        loop {
            match next_event(events).await {
                ServiceEvent::ConfigurationChanged { content } => {
                    let stamp = content.as_ref().and_then(VersionStamp::from_content);
                    assert_eq!(stamp, Some(VersionStamp::section("auth", "2")));
                    break;
                }
                ServiceEvent::HeartbeatAcknowledged => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    svc_a.close().await;
    svc_b.close().await;
    relay.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_master_change_survives_failed_service() {
    let net = MemoryNetwork::new();
    let fake_master = Probe::new(&net, "master", addr(MASTER_IP, 10000));
    let relay = slave(
        &net,
        SlaveNodeConfig {
            master: Some(addr(MASTER_IP, 10000)),
            ..SlaveNodeConfig::default()
        },
    );
    relay.node.start();

    let unreachable = Probe::new(&net, "svc-a", addr(SLAVE_IP, 4000));
    let healthy = Probe::new(&net, "svc-b", addr(SLAVE_IP, 4001));
    for probe in [&unreachable, &healthy] {
        probe
            .send(
                Envelope::new(MessageType::HandshakeRequest),
                addr(SLAVE_IP, 10002),
            )
            .await;
        probe.expect(MessageType::HandshakeResponse).await;
    }

    net.fail_sends_to(addr(SLAVE_IP, 4000));
    fake_master
        .send(
            Envelope::new(MessageType::ConfigurationChange)
                .with_content(VersionStamp::section("auth", "3").to_content()),
            addr(SLAVE_IP, 10000),
        )
        .await;

    let change = healthy.expect(MessageType::ConfigurationChange).await;
    assert_eq!(stamp_of(&change), Some(VersionStamp::section("auth", "3")));
    assert!(
        unreachable
            .collect(MessageType::ConfigurationChange, Duration::from_secs(5))
            .await
            .is_empty()
    );
    assert_eq!(relay.node.registry().len(), 2);

    relay.node.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_slave_sweeps_silent_services() {
    let net = MemoryNetwork::new();
    let relay = slave(
        &net,
        SlaveNodeConfig {
            sweep_interval: Duration::from_secs(60),
            peer_expiry: Duration::from_secs(90),
            ..SlaveNodeConfig::default()
        },
    );
    relay.node.start();

    let quiet = Probe::new(&net, "svc-quiet", addr(SLAVE_IP, 4000));
    quiet
        .send(
            Envelope::new(MessageType::HeartbeatRequest),
            addr(SLAVE_IP, 10002),
        )
        .await;
    quiet.expect(MessageType::HeartbeatResponse).await;
    assert_eq!(relay.node.registry().len(), 1);

    relay.clock.advance(Duration::from_secs(91));
    eventually("service expired", || relay.node.registry().is_empty()).await;

    relay.node.close().await;
}
