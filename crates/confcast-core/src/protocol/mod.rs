//! Wire protocol types for node-to-node datagrams.
//!
//! Every datagram carries exactly one [`Envelope`] serialized as JSON.
//! Version stamps ride inside the envelope content.

pub mod message;
pub mod version;

pub use message::{Content, DecodeError, Envelope, MAX_DATAGRAM_SIZE, MessageType};
pub use version::{VersionKind, VersionStamp};
