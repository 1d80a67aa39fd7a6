//! File-backed collaborators for the node roles.
//!
//! - `FileSettingStore`: one JSON file per module under `settings/`. The
//!   master's version source.
//! - `FileAllowList`: one file per allowed relay IP under `members/`.
//! - `VersionLedger`: the slave's record of what it has pulled.

use crate::config::{replace_file, replace_file_async};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use confcast_core::protocol::{VersionKind, VersionStamp};
use confcast_core::providers::{
    CollaboratorError, ConfigurationPuller, MembershipProvider, VersionProvider,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reject ids that would escape the store directory.
fn file_for(dir: &Path, id: &str) -> Result<PathBuf> {
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
        bail!("Invalid store id {:?}", id);
    }
    Ok(dir.join(format!("{}.json", id)))
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingItem {
    pub value: Value,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A module's settings. The module version covers the whole section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingSection {
    pub name: String,
    pub module_name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub items: BTreeMap<String, SettingItem>,
}

impl SettingSection {
    pub fn new(module_name: &str, version: &str) -> Self {
        Self {
            name: module_name.to_string(),
            module_name: module_name.to_string(),
            version: version.to_string(),
            description: None,
            items: BTreeMap::new(),
        }
    }

    pub fn with_item(mut self, name: &str, value: Value, version: &str) -> Self {
        self.items.insert(
            name.to_string(),
            SettingItem {
                value,
                version: version.to_string(),
                description: None,
            },
        );
        self
    }

    pub fn stamp(&self) -> VersionStamp {
        VersionStamp::section(self.module_name.clone(), self.version.clone())
    }

    pub fn item_stamps(&self) -> Vec<VersionStamp> {
        self.items
            .iter()
            .map(|(name, item)| VersionStamp::item(name.clone(), item.version.clone()))
            .collect()
    }
}

/// Setting sections stored as `<dir>/<module>.json`.
#[derive(Debug, Clone)]
pub struct FileSettingStore {
    dir: PathBuf,
}

impl FileSettingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn save(&self, section: &SettingSection) -> Result<()> {
        let path = file_for(&self.dir, &section.module_name)?;
        replace_file(&path, &serde_json::to_string_pretty(section)?, false)
    }

    pub fn get(&self, module: &str) -> Result<Option<SettingSection>> {
        let path = file_for(&self.dir, module)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let section = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(section))
    }

    pub fn delete(&self, module: &str) -> Result<bool> {
        let path = file_for(&self.dir, module)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(true)
    }

    /// Every readable section, sorted by module. Broken files are skipped.
    pub fn all(&self) -> Result<Vec<SettingSection>> {
        let mut sections = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<SettingSection>(&c).map_err(Into::into));
            match parsed {
                Ok(section) => sections.push(section),
                Err(e) => warn!("Skipping setting file {}: {}", path.display(), e),
            }
        }
        sections.sort_by(|a, b| a.module_name.cmp(&b.module_name));
        Ok(sections)
    }
}

impl VersionProvider for FileSettingStore {
    fn module_versions(&self) -> Vec<VersionStamp> {
        match self.all() {
            Ok(sections) => sections.iter().map(SettingSection::stamp).collect(),
            Err(e) => {
                warn!("Failed to read settings: {:#}", e);
                Vec::new()
            }
        }
    }

    fn section_versions(&self, module: &str) -> Vec<VersionStamp> {
        match self.get(module) {
            Ok(Some(section)) => section.item_stamps(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read settings for {}: {:#}", module, e);
                Vec::new()
            }
        }
    }
}

// ============================================================================
// Allow-list
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberEntry {
    address: IpAddr,
    added_at_ms: u64,
}

/// Relay allow-list stored as `<dir>/<ip>.json`.
#[derive(Debug, Clone)]
pub struct FileAllowList {
    dir: PathBuf,
}

impl FileAllowList {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, ip: &IpAddr) -> PathBuf {
        self.dir.join(format!("{}.json", ip))
    }

    pub fn add(&self, ip: IpAddr) -> Result<()> {
        let entry = MemberEntry {
            address: ip,
            added_at_ms: now_ms(),
        };
        replace_file(&self.path_for(&ip), &serde_json::to_string_pretty(&entry)?, false)
    }

    pub fn remove(&self, ip: &IpAddr) -> Result<bool> {
        let path = self.path_for(ip);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(true)
    }

    pub fn members(&self) -> Result<Vec<IpAddr>> {
        let mut members = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let ip = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<IpAddr>().ok());
            if let Some(ip) = ip {
                members.push(ip);
            }
        }
        members.sort();
        Ok(members)
    }
}

impl MembershipProvider for FileAllowList {
    fn is_member(&self, ip: &IpAddr) -> bool {
        self.path_for(ip).exists()
    }
}

// ============================================================================
// Version ledger
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerFile {
    pub master: Option<SocketAddr>,
    pub last_pull_ms: u64,
    pub stamps: Vec<VersionStamp>,
}

/// Records each pulled stamp in `versions.json`.
///
/// Content transfer is not part of the protocol; the ledger is what a
/// content fetcher would key off.
#[derive(Debug)]
pub struct VersionLedger {
    path: PathBuf,
    state: Mutex<LedgerFile>,
}

impl VersionLedger {
    /// Open the ledger, starting empty if the file is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Ignoring unreadable ledger {}: {}", path.display(), e);
                LedgerFile::default()
            }),
            Err(_) => LedgerFile::default(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> LedgerFile {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Last recorded version for a stamp name and kind.
    pub fn version_of(&self, name: &str, kind: VersionKind) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stamps
            .iter()
            .find(|s| s.name == name && s.kind == kind)
            .map(|s| s.version.clone())
    }

    /// Update the in-memory ledger and return the file contents to write.
    fn record(&self, master: SocketAddr, stamp: Option<&VersionStamp>) -> Result<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.master = Some(master);
        state.last_pull_ms = now_ms();
        if let Some(stamp) = stamp {
            match state
                .stamps
                .iter_mut()
                .find(|s| s.name == stamp.name && s.kind == stamp.kind)
            {
                Some(existing) => existing.version = stamp.version.clone(),
                None => state.stamps.push(stamp.clone()),
            }
        }
        Ok(serde_json::to_string_pretty(&*state)?)
    }

    async fn persist(&self, master: SocketAddr, stamp: Option<&VersionStamp>) -> Result<()> {
        let contents = self.record(master, stamp)?;
        replace_file_async(&self.path, contents).await
    }
}

#[async_trait]
impl ConfigurationPuller for VersionLedger {
    async fn pull(
        &self,
        master: SocketAddr,
        stamp: Option<&VersionStamp>,
    ) -> Result<(), CollaboratorError> {
        match stamp {
            Some(stamp) => info!(
                "Pulling {} version {} from {}",
                stamp.name, stamp.version, master
            ),
            None => debug!("Pulling configuration from {}", master),
        }
        self.persist(master, stamp)
            .await
            .map_err(|e| CollaboratorError::Storage(format!("{:#}", e)))
    }
}
