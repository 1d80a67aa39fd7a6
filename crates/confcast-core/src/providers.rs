//! Collaborator traits the node roles call out to.
//!
//! The roles never touch disk. Version sets, the relay allow-list, the bound
//! master address and configuration pulls all go through these traits. The
//! in-memory implementations here back tests and embedded use; the daemon
//! provides file-backed ones.

use crate::protocol::VersionStamp;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Pull failed: {0}")]
    Pull(String),
}

/// Source of the master's canonical version set.
pub trait VersionProvider: Send + Sync {
    /// One section stamp per module.
    fn module_versions(&self) -> Vec<VersionStamp>;

    /// Item stamps within one module. Empty for unknown modules.
    fn section_versions(&self, module: &str) -> Vec<VersionStamp>;
}

/// Allow-list of relays the master will talk to.
pub trait MembershipProvider: Send + Sync {
    fn is_member(&self, ip: &IpAddr) -> bool;
}

/// Where a slave records the master it bound to.
pub trait MasterAddressStore: Send + Sync {
    fn save_master_address(&self, addr: SocketAddr) -> Result<(), CollaboratorError>;
}

/// Fetches configuration content from the master after a change notice.
#[async_trait]
pub trait ConfigurationPuller: Send + Sync {
    async fn pull(
        &self,
        master: SocketAddr,
        stamp: Option<&VersionStamp>,
    ) -> Result<(), CollaboratorError>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

#[derive(Debug, Default)]
struct Module {
    version: String,
    items: Vec<VersionStamp>,
}

/// Version set held in memory, keyed by module name.
#[derive(Debug, Default)]
pub struct StaticVersions {
    modules: RwLock<BTreeMap<String, Module>>,
}

impl StaticVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a module with its items as `(name, version)` pairs.
    pub fn set_module(&self, name: &str, version: &str, items: &[(&str, &str)]) {
        let module = Module {
            version: version.to_string(),
            items: items
                .iter()
                .map(|(item, v)| VersionStamp::item(*item, *v))
                .collect(),
        };
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), module);
    }
}

impl VersionProvider for StaticVersions {
    fn module_versions(&self) -> Vec<VersionStamp> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, module)| VersionStamp::section(name.clone(), module.version.clone()))
            .collect()
    }

    fn section_versions(&self, module: &str) -> Vec<VersionStamp> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .map(|m| m.items.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct AllowList {
    members: RwLock<HashSet<IpAddr>>,
}

impl AllowList {
    pub fn new(members: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            members: RwLock::new(members.into_iter().collect()),
        }
    }

    pub fn allow(&self, ip: IpAddr) {
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ip);
    }

    pub fn revoke(&self, ip: &IpAddr) {
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ip);
    }
}

impl MembershipProvider for AllowList {
    fn is_member(&self, ip: &IpAddr) -> bool {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(ip)
    }
}

/// Records saved master addresses instead of persisting them.
#[derive(Debug, Default)]
pub struct MemoryMasterStore {
    saved: Mutex<Vec<SocketAddr>>,
}

impl MemoryMasterStore {
    pub fn saved(&self) -> Vec<SocketAddr> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl MasterAddressStore for MemoryMasterStore {
    fn save_master_address(&self, addr: SocketAddr) -> Result<(), CollaboratorError> {
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(addr);
        Ok(())
    }
}

/// Records pulls and optionally fails them.
#[derive(Debug, Default)]
pub struct MemoryPuller {
    pulls: Mutex<Vec<(SocketAddr, Option<VersionStamp>)>>,
    failing: AtomicBool,
}

impl MemoryPuller {
    pub fn pulls(&self) -> Vec<(SocketAddr, Option<VersionStamp>)> {
        self.pulls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigurationPuller for MemoryPuller {
    async fn pull(
        &self,
        master: SocketAddr,
        stamp: Option<&VersionStamp>,
    ) -> Result<(), CollaboratorError> {
        self.pulls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((master, stamp.cloned()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Pull(format!("{master} unreachable")));
        }
        Ok(())
    }
}
