//! confcast-daemon: Native runtime for confcast nodes.
//!
//! Provides the pieces `confcast-core` leaves abstract: UDP and multicast
//! channels, the JSON node config file, and file-backed version, allow-list
//! and snapshot stores.

pub mod config;
pub mod persistence;
pub mod store;
pub mod udp;

pub use config::{Address, MasterAddressFile, NodeConfig};
pub use persistence::{PeerSnapshot, PeerSnapshotStore};
pub use store::{
    FileAllowList, FileSettingStore, LedgerFile, SettingItem, SettingSection, VersionLedger,
};
pub use udp::UdpChannel;
