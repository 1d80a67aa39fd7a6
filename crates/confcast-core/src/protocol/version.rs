//! Version stamps carried in configuration notices.
//!
//! A stamp stands in for configuration content: receivers compare it as an
//! opaque token and pull the content out of band.

use super::message::Content;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Granularity of a stamp. Wire value is the ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionKind {
    /// A whole module section.
    Section,
    /// A single item within a section.
    Item,
}

impl VersionKind {
    fn from_wire(n: u64) -> Option<Self> {
        match n {
            0 => Some(VersionKind::Section),
            1 => Some(VersionKind::Item),
            _ => None,
        }
    }

    fn to_wire(self) -> u64 {
        match self {
            VersionKind::Section => 0,
            VersionKind::Item => 1,
        }
    }
}

impl Serialize for VersionKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for VersionKind {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let n = u64::deserialize(d)?;
        VersionKind::from_wire(n)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown version kind {n}")))
    }
}

/// `(name, version, kind)` token for one configuration unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: VersionKind,
}

impl VersionStamp {
    pub fn section(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind: VersionKind::Section,
        }
    }

    pub fn item(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind: VersionKind::Item,
        }
    }

    /// Envelope content `{"name","version","type"}`.
    pub fn to_content(&self) -> Content {
        let mut content = Content::new();
        content.insert("name".into(), Value::String(self.name.clone()));
        content.insert("version".into(), Value::String(self.version.clone()));
        content.insert("type".into(), Value::from(self.kind.to_wire()));
        content
    }

    /// Read a stamp back out of envelope content.
    ///
    /// Numeric versions are accepted and kept as their decimal text. A
    /// missing `type` reads as a section stamp.
    pub fn from_content(content: &Content) -> Option<Self> {
        let name = content.get("name")?.as_str()?.to_string();
        let version = match content.get("version")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let kind = match content.get("type") {
            Some(value) => VersionKind::from_wire(value.as_u64()?)?,
            None => VersionKind::Section,
        };
        Some(Self {
            name,
            version,
            kind,
        })
    }
}
