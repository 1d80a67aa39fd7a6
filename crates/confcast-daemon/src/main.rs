//! confcast: configuration propagation daemon.
//!
//! One binary for all three roles. `master` owns the settings and broadcasts
//! version stamps, `slave` relays them to the services on its host, `service`
//! attaches to a local slave and reports changes.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use confcast_core::{
    Endpoint, Envelope, MasterContext, MasterNode, MasterNodeConfig, MessageType, NodeId,
    PeerRegistry, ServiceEvent, ServiceNode, ServiceNodeConfig, SlaveContext, SlaveNode,
    SlaveNodeConfig, SystemClock,
};
use confcast_daemon::{
    FileAllowList, FileSettingStore, MasterAddressFile, NodeConfig, PeerSnapshotStore,
    SettingSection, UdpChannel, VersionLedger,
};

#[derive(Parser, Debug)]
#[command(name = "confcast")]
#[command(about = "Hierarchical configuration propagation daemon")]
struct Args {
    /// Path to the node config file
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Directory for settings, allow-list, ledger and peer snapshots
    #[arg(long, default_value = ".confcast", global = true)]
    state_dir: PathBuf,

    /// Node name (generated if not provided)
    #[arg(long, global = true)]
    name: Option<String>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the master: answer relay discovery and broadcast version stamps
    Master,
    /// Run a relay between the master and local service nodes
    Slave,
    /// Attach to the local relay and log configuration changes
    Service,
    /// Allow a relay IP to register with the master
    Allow {
        ip: IpAddr,
        /// Remove the IP instead
        #[arg(long)]
        revoke: bool,
    },
    /// Write a module's settings and tell the master to broadcast
    Publish {
        #[arg(long)]
        module: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        description: Option<String>,
        /// Setting as `name=value`; value is parsed as JSON, else kept as text
        #[arg(long = "item")]
        items: Vec<String>,
    },
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn node_id(name: Option<String>) -> Result<NodeId> {
    match name {
        Some(name) => Ok(NodeId::new(name)?),
        None => {
            let id = NodeId::generate();
            info!("Generated node name: {}", id);
            Ok(id)
        }
    }
}

/// Restore a registry snapshot. A broken snapshot is logged and ignored.
fn restore_peers(store: &PeerSnapshotStore, registry: &PeerRegistry) {
    match store.load() {
        Ok(snapshot) => {
            let restored = registry.restore(snapshot.peers);
            if restored > 0 {
                info!("Restored {} peer(s) from {}", restored, store.path().display());
            }
        }
        Err(e) => warn!("Ignoring peer snapshot: {:#}", e),
    }
}

fn save_peers(store: &PeerSnapshotStore, role: &str, registry: &PeerRegistry) {
    if let Err(e) = store.save(role, &registry.list(), now_ms()) {
        error!("Failed to save peer snapshot: {:#}", e);
    }
}

async fn run_master(config: &NodeConfig, state_dir: &Path, name: NodeId) -> Result<()> {
    let group = config.master.discovery.require_socket_addr()?;
    let listen = config.master.config.require_socket_addr()?;

    let discovery = UdpChannel::multicast(group)
        .with_context(|| format!("Failed to join discovery group {}", group))?;
    let local = UdpChannel::bind(listen)
        .await
        .with_context(|| format!("Failed to bind config listener {}", listen))?;

    let context = MasterContext {
        versions: Arc::new(FileSettingStore::new(state_dir.join("settings"))?),
        membership: Arc::new(FileAllowList::new(state_dir.join("members"))?),
        clock: Arc::new(SystemClock),
    };
    let node = MasterNode::new(
        Endpoint::new(name.clone(), Arc::new(discovery)),
        Endpoint::new(name, Arc::new(local)),
        MasterNodeConfig {
            group,
            ..Default::default()
        },
        context,
    );

    let snapshots = PeerSnapshotStore::for_role(state_dir, "master");
    restore_peers(&snapshots, node.registry());

    info!("Master {} on group {}, config listener {}", node.identity(), group, listen);
    node.start();

    info!("Master running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    node.close().await;
    save_peers(&snapshots, "master", node.registry());
    Ok(())
}

async fn run_slave(
    config: &NodeConfig,
    config_path: &Path,
    state_dir: &Path,
    name: NodeId,
) -> Result<()> {
    let group = config.slave.register.require_socket_addr()?;
    let listen = config.slave.config.require_socket_addr()?;
    let master = config.slave.master.socket_addr()?;

    let upstream = UdpChannel::multicast(group)
        .with_context(|| format!("Failed to join register group {}", group))?;
    let local = UdpChannel::bind(listen)
        .await
        .with_context(|| format!("Failed to bind service listener {}", listen))?;

    let context = SlaveContext {
        master_store: Arc::new(MasterAddressFile::new(config_path)),
        puller: Arc::new(VersionLedger::open(state_dir.join("versions.json"))),
        clock: Arc::new(SystemClock),
    };
    let node = SlaveNode::new(
        Endpoint::new(name.clone(), Arc::new(upstream)),
        Endpoint::new(name, Arc::new(local)),
        SlaveNodeConfig {
            group,
            master,
            ..Default::default()
        },
        context,
    );

    let snapshots = PeerSnapshotStore::for_role(state_dir, "slave");
    restore_peers(&snapshots, node.registry());

    match master {
        Some(master) => info!("Slave {} using configured master {}", node.identity(), master),
        None => info!("Slave {} discovering master on {}", node.identity(), group),
    }
    node.start();

    info!("Slave running on {}. Press Ctrl+C to stop.", listen);
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    node.close().await;
    save_peers(&snapshots, "slave", node.registry());
    Ok(())
}

async fn run_service(config: &NodeConfig, name: NodeId) -> Result<()> {
    let slave = config.service.slave.require_socket_addr()?;
    let channel = UdpChannel::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;

    let (node, mut events) = ServiceNode::new(
        Endpoint::new(name, Arc::new(channel)),
        slave,
        ServiceNodeConfig::default(),
    );
    info!("Service {} attaching to {}", node.identity(), slave);
    node.start();

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                ServiceEvent::Connected => {
                    info!("Connected to {}", slave);
                    if let Err(e) = node.request_configuration().await {
                        warn!("Failed to request configuration: {}", e);
                    }
                }
                ServiceEvent::HeartbeatAcknowledged => {}
                ServiceEvent::ConfigurationChanged { content } => match content {
                    Some(content) => info!("Configuration changed: {}", serde_json::Value::Object(content)),
                    None => info!("Configuration changed"),
                },
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    node.close().await;
    Ok(())
}

fn allow(state_dir: &Path, ip: IpAddr, revoke: bool) -> Result<()> {
    let list = FileAllowList::new(state_dir.join("members"))?;
    if revoke {
        if list.remove(&ip)? {
            info!("Revoked {}", ip);
        } else {
            info!("{} was not allowed", ip);
        }
    } else {
        list.add(ip)?;
        info!("Allowed {}", ip);
    }
    Ok(())
}

fn parse_item(raw: &str) -> Result<(String, Value)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("Item {:?} is not name=value", raw);
    };
    if name.is_empty() {
        bail!("Item {:?} has an empty name", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

async fn publish(
    config: &NodeConfig,
    state_dir: &Path,
    name: NodeId,
    section: SettingSection,
) -> Result<()> {
    let store = FileSettingStore::new(state_dir.join("settings"))?;
    store.save(&section)?;
    info!("Saved {} version {}", section.module_name, section.version);

    let mut target = config.master.config.require_socket_addr()?;
    if target.ip().is_unspecified() {
        target.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    let channel = UdpChannel::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    let endpoint = Endpoint::new(name, Arc::new(channel));
    let notice =
        Envelope::new(MessageType::ConfigurationChange).with_content(section.stamp().to_content());
    endpoint
        .send(&notice, target)
        .await
        .with_context(|| format!("Failed to notify master at {}", target))?;
    info!("Notified master at {}", target);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,confcast=debug"
    } else {
        "info,confcast=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = NodeConfig::load(&args.config);
    let name = node_id(args.name)?;

    match args.command {
        Command::Master => run_master(&config, &args.state_dir, name).await,
        Command::Slave => run_slave(&config, &args.config, &args.state_dir, name).await,
        Command::Service => run_service(&config, name).await,
        Command::Allow { ip, revoke } => allow(&args.state_dir, ip, revoke),
        Command::Publish {
            module,
            version,
            description,
            items,
        } => {
            let mut section = SettingSection::new(&module, &version);
            section.description = description;
            for raw in &items {
                let (item, value) = parse_item(raw)?;
                section = section.with_item(&item, value, &version);
            }
            publish(&config, &args.state_dir, name, section).await
        }
    }
}
