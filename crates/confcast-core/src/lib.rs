//! confcast-core: Shared Rust library for hierarchical configuration propagation.
//!
//! This crate provides the core functionality for:
//! - The message envelope and its JSON wire form
//! - Soft-state peer registries with heartbeat expiry
//! - Service, slave and master node roles
//! - DatagramChannel and collaborator trait abstractions
//!
//! Sockets, files and the CLI live in `confcast-daemon`. Everything here runs
//! against the in-process [`memory::MemoryNetwork`] in tests.

pub mod memory;
pub mod node;
pub mod node_id;
pub mod peers;
pub mod protocol;
pub mod providers;
pub mod schedule;
pub mod transport;

pub use memory::{MemoryChannel, MemoryNetwork};
pub use node::master::{MasterContext, MasterNode, MasterNodeConfig};
pub use node::service::{ServiceEvent, ServiceNode, ServiceNodeConfig, ServiceState};
pub use node::slave::{FanOut, SlaveContext, SlaveNode, SlaveNodeConfig};
pub use node_id::{NodeId, NodeIdError};
pub use peers::{PeerKey, PeerRecord, PeerRegistry, Upsert};
pub use protocol::{DecodeError, Envelope, MessageType, VersionKind, VersionStamp};
pub use providers::{
    CollaboratorError, ConfigurationPuller, MasterAddressStore, MembershipProvider,
    VersionProvider,
};
pub use schedule::{Clock, ManualClock, Schedule, SystemClock};
pub use transport::{DatagramChannel, Endpoint, Inbound, RecvError, TransportError};
