//! NodeId: Name of a node in the configuration hierarchy.
//!
//! Used as the envelope `from`/`to` field and for self-message filtering.
//! Either assigned by the operator or generated at startup.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("Node ID cannot be empty")]
    Empty,
}

/// A non-empty node name, fixed for the lifetime of the process.
///
/// # Examples
/// ```
/// use confcast_core::NodeId;
///
/// let id: NodeId = "relay-eu-1".parse().unwrap();
/// assert_eq!(id.as_str(), "relay-eu-1");
///
/// let generated = NodeId::generate();
/// assert_eq!(generated.as_str().len(), 32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Result<Self, NodeIdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NodeIdError::Empty);
        }
        Ok(Self(name))
    }

    /// Generate a random name (uuid v4, hyphenless).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = NodeIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> String {
        id.0
    }
}

impl PartialEq<str> for NodeId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rejected() {
        assert_eq!(NodeId::new(""), Err(NodeIdError::Empty));
        assert!("".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_generate_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_display_roundtrip() {
        let id = NodeId::new("svc-42").unwrap();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_serde_is_plain_string() {
        let id = NodeId::new("master").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"master\"");

        let back: NodeId = serde_json::from_str("\"master\"").unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<NodeId>("\"\"").is_err());
    }
}
