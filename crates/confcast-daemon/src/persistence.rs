//! Persistence for peer registries.
//!
//! A node writes its registry to `<state-dir>/<role>-peers.json` on shutdown
//! and restores it on start, so relays and services are not forgotten across
//! a restart. Restored peers still expire if they stay silent.

use crate::config::replace_file;
use anyhow::{Context, Result};
use confcast_core::peers::PeerRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk registry snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    /// Role that wrote the snapshot ("master" or "slave")
    pub role: String,
    /// When the snapshot was written (ms since epoch)
    pub saved_at_ms: u64,
    pub peers: Vec<PeerRecord>,
}

#[derive(Debug, Clone)]
pub struct PeerSnapshotStore {
    path: PathBuf,
}

impl PeerSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for `role` inside `state_dir`.
    pub fn for_role(state_dir: &Path, role: &str) -> Self {
        Self::new(state_dir.join(format!("{}-peers.json", role)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, role: &str, peers: &[PeerRecord], now_ms: u64) -> Result<()> {
        let snapshot = PeerSnapshot {
            role: role.to_string(),
            saved_at_ms: now_ms,
            peers: peers.to_vec(),
        };
        replace_file(&self.path, &serde_json::to_string_pretty(&snapshot)?, false)?;
        debug!("Saved {} peers to {}", peers.len(), self.path.display());
        Ok(())
    }

    /// Load the snapshot. A missing file is an empty snapshot.
    pub fn load(&self) -> Result<PeerSnapshot> {
        if !self.path.exists() {
            return Ok(PeerSnapshot::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }
}
