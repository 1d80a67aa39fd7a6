//! Node configuration file.
//!
//! One JSON file holds the addresses for every role:
//!
//! ```json
//! {
//!   "master":  {"discovery": {..}, "config": {..}},
//!   "slave":   {"register": {..}, "master": {..}, "config": {..}},
//!   "service": {"slave": {..}}
//! }
//! ```
//!
//! Missing sections fall back to defaults. A slave persists the master it
//! discovers back into `slave.master` with [`MasterAddressFile`].

use anyhow::{Context, Result, bail};
use confcast_core::providers::{CollaboratorError, MasterAddressStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};

/// One endpoint in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Host or IP. `None` for an address not yet known.
    pub address: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Address {
    fn new(address: Option<&str>, port: u16, name: &str, description: &str) -> Self {
        Self {
            address: address.map(str::to_string),
            port,
            name: name.to_string(),
            description: description.to_string(),
        }
    }

    /// Resolve to a socket address. `Ok(None)` when no host is configured.
    pub fn socket_addr(&self) -> Result<Option<SocketAddr>> {
        let Some(host) = self.address.as_deref() else {
            return Ok(None);
        };
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Some(SocketAddr::new(ip, self.port)));
        }
        let resolved = (host, self.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}", host))?
            .next();
        match resolved {
            Some(addr) => Ok(Some(addr)),
            None => bail!("{} resolved to no addresses", host),
        }
    }

    /// Like [`Address::socket_addr`], but a missing host is an error.
    pub fn require_socket_addr(&self) -> Result<SocketAddr> {
        self.socket_addr()?
            .with_context(|| format!("No address configured for {}", self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSection {
    /// Multicast group for relay discovery and broadcasts
    pub discovery: Address,
    /// Listener for configuration change announcements
    pub config: Address,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            discovery: Address::new(
                Some("224.0.0.1"),
                10000,
                "discovery",
                "Relay handshakes and heartbeats, periodic version broadcasts",
            ),
            config: Address::new(
                Some("0.0.0.0"),
                10001,
                "config",
                "Configuration change announcements",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveSection {
    /// Multicast group used to discover the master
    pub register: Address,
    /// Bound master. Address is null until discovered.
    pub master: Address,
    /// Listener for local service nodes
    pub config: Address,
}

impl Default for SlaveSection {
    fn default() -> Self {
        Self {
            register: Address::new(
                Some("224.0.0.1"),
                10000,
                "register",
                "Master discovery handshakes",
            ),
            master: Address::new(
                None,
                10000,
                "master",
                "Master heartbeats and configuration notices",
            ),
            config: Address::new(
                Some("127.0.0.1"),
                10002,
                "config",
                "Local service node handshakes, heartbeats and change notices",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// The relay this service node attaches to
    pub slave: Address,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            slave: Address::new(
                Some("127.0.0.1"),
                10002,
                "slave",
                "Local relay for handshakes, heartbeats and change notices",
            ),
        }
    }
}

/// The whole config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub master: MasterSection,
    pub slave: SlaveSection,
    pub service: ServiceSection,
}

impl NodeConfig {
    /// Read and parse the file. Errors on a missing or malformed file.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Read the file, falling back to defaults if it is missing or broken.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::read(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{:#}; using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        replace_file(path, &contents, false)
    }
}

/// Writes the discovered master into `slave.master` of the config file.
///
/// Fields the daemon does not know about are preserved. The previous file is
/// kept as `<path>.bak.<unix millis>`.
#[derive(Debug, Clone)]
pub struct MasterAddressFile {
    path: PathBuf,
}

impl MasterAddressFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewrite(&self, master: SocketAddr) -> Result<()> {
        let mut doc: Value = if self.path.exists() {
            let contents = fs::read_to_string(&self.path)
                .with_context(|| format!("Failed to read {}", self.path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", self.path.display()))?
        } else {
            serde_json::to_value(NodeConfig::default())?
        };

        let root = doc.as_object_mut().context("Config root is not an object")?;
        let slave = root
            .entry("slave")
            .or_insert_with(|| Value::Object(Default::default()))
            .as_object_mut()
            .context("`slave` is not an object")?;
        let entry = slave
            .entry("master")
            .or_insert(serde_json::to_value(SlaveSection::default().master)?)
            .as_object_mut()
            .context("`slave.master` is not an object")?;
        entry.insert("address".into(), Value::String(master.ip().to_string()));
        entry.insert("port".into(), Value::from(master.port()));

        let contents = serde_json::to_string_pretty(&doc)?;
        replace_file(&self.path, &contents, true)
    }
}

impl MasterAddressStore for MasterAddressFile {
    fn save_master_address(&self, addr: SocketAddr) -> Result<(), CollaboratorError> {
        self.rewrite(addr)
            .map_err(|e| CollaboratorError::Storage(format!("{:#}", e)))?;
        info!("Saved master address {} to {}", addr, self.path.display());
        Ok(())
    }
}

/// Replace `path` via a sibling temp file and rename.
///
/// With `backup`, an existing file is renamed to `<path>.bak.<unix millis>`
/// first instead of being overwritten.
pub(crate) fn replace_file(path: &Path, contents: &str, backup: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let tmp = sibling(path, "~");
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;

    if backup && path.exists() {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let bak = sibling(path, &format!(".bak.{}", millis));
        fs::rename(path, &bak)
            .with_context(|| format!("Failed to back up {} to {}", path.display(), bak.display()))?;
    }

    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// [`replace_file`] for async callers, without the backup step.
pub(crate) async fn replace_file_async(path: &Path, contents: String) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let tmp = sibling(path, "~");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
