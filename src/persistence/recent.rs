//! Recently-launched games, most recent first

use crate::library::IdentityKey;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

pub const RECENT_FILE: &str = "recent.toml";

#[derive(Deserialize, Serialize, Default)]
struct RecentFile {
    #[serde(default)]
    entries: Vec<String>,
}

/// Bounded, duplicate-free list of identity keys.
#[derive(Clone, Debug, PartialEq)]
pub struct RecentList {
    entries: Vec<IdentityKey>,
    cap: usize,
}

impl RecentList {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            cap: cap.max(1),
        }
    }

    pub fn entries(&self) -> &[IdentityKey] {
        &self.entries
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Moves `key` to the front, inserting it if new, and drops whatever falls off the end.
    pub fn promote(&mut self, key: IdentityKey) {
        self.entries.retain(|entry| entry != &key);
        self.entries.insert(0, key);
        self.entries.truncate(self.cap);
    }

    /// Drops `key` from the list. Returns false when it was not there.
    pub fn remove(&mut self, key: &IdentityKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry != key);
        self.entries.len() != before
    }

    /// Builds a list from stored entries: invalid keys are skipped, later duplicates dropped.
    pub fn from_toml_str(content: &str, cap: usize) -> Result<Self> {
        let file: RecentFile =
            toml::from_str(content).map_err(|e| eyre!("Malformed recent list: {}", e))?;

        let mut list = Self::new(cap);
        for raw in file.entries {
            match IdentityKey::parse(&raw) {
                Ok(key) if !list.entries.contains(&key) => list.entries.push(key),
                Ok(key) => debug!("Dropping duplicate recent entry {}", key),
                Err(e) => warn!("Dropping recent entry: {}", e),
            }
        }
        list.entries.truncate(list.cap);
        Ok(list)
    }

    /// Loads the list; a missing or unreadable file gives an empty list.
    pub async fn load(path: &Path, cap: usize) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No recent list at {}, starting empty", path.display());
                return Self::new(cap);
            }
            Err(e) => {
                warn!("Failed to read {}: {}, starting empty", path.display(), e);
                return Self::new(cap);
            }
        };

        match Self::from_toml_str(&content, cap) {
            Ok(list) => {
                debug!("Loaded {} recent entries", list.entries.len());
                list
            }
            Err(e) => {
                warn!("{} ({}), starting empty", e, path.display());
                Self::new(cap)
            }
        }
    }

    /// Writes the list atomically: temp file, then rename over the old one.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create {}: {}", parent.display(), e))?;
        }

        let file = RecentFile {
            entries: self.entries.iter().map(|key| key.to_string()).collect(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| eyre!("Failed to serialize recent list: {}", e))?;

        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| eyre!("Failed to replace {}: {}", path.display(), e))?;

        debug!("Saved {} recent entries to {}", self.entries.len(), path.display());
        Ok(())
    }
}
