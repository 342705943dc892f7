//! Game library aggregation
//!
//! Every installed game ends up as one [`GameRecord`]. Sources ([`steam`],
//! [`flatpak`], [`lutris`], [`custom`]) report what they find independently, the
//! [`scanner`] runs them concurrently under a timeout and the [`catalog`]
//! merges the results into a single deduplicated list.

pub mod catalog;
pub mod custom;
pub mod flatpak;
pub mod launcher;
pub mod lutris;
pub mod scanner;
pub mod steam;

pub use catalog::{merge, Catalog, CatalogStore};
pub use launcher::LaunchError;
pub use scanner::{LibraryScanner, ScanReport, SourceOutcome};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Stable identity of a game across sources and restarts.
///
/// `steam:<appid>`, `flatpak:<app-ref>`, `lutris:<slug>` or
/// `custom:<normalized absolute path>`. Two records with the same key are the
/// same game.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

const KEY_PREFIXES: [&str; 4] = ["steam:", "flatpak:", "lutris:", "custom:"];

impl IdentityKey {
    pub fn steam(appid: &str) -> Self {
        Self(format!("steam:{}", appid.trim()))
    }

    pub fn flatpak(app_ref: &str) -> Self {
        Self(format!("flatpak:{}", app_ref.trim()))
    }

    pub fn lutris(slug: &str) -> Self {
        Self(format!("lutris:{}", slug.trim()))
    }

    pub fn custom(path: &Path) -> Self {
        Self(format!("custom:{}", normalize_path(path).display()))
    }

    /// Accepts any string with a known source prefix and a non-empty id.
    pub fn parse(raw: &str) -> Result<Self, LibraryError> {
        let raw = raw.trim();
        let valid = KEY_PREFIXES
            .iter()
            .any(|prefix| raw.len() > prefix.len() && raw.starts_with(prefix));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(LibraryError::Parse(format!("invalid game id '{}'", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a record came from. Declaration order is merge priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceTag {
    Steam,
    Flatpak,
    Lutris,
    Custom,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceTag::Steam => "Steam",
            SourceTag::Flatpak => "Flatpak",
            SourceTag::Lutris => "Lutris",
            SourceTag::Custom => "Custom",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: IdentityKey,
    pub name: String,
    pub icon: Option<PathBuf>,
    pub launch: LaunchCommand,
    pub source: SourceTag,
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("{0} scan timed out after {1:?}")]
    SourceTimeout(SourceTag, Duration),

    #[error("Scan cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// A place games can be discovered. Scans are blocking and run on the blocking pool.
pub trait GameSource: Send + Sync {
    fn tag(&self) -> SourceTag;

    /// Lists the games this source knows about. Implementations check `cancel`
    /// between units of work and bail out with [`LibraryError::Cancelled`].
    fn scan(&self, cancel: &CancellationToken) -> Result<Vec<GameRecord>, LibraryError>;
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}

/// Absolute, symlink-resolved path when the file exists; lexically cleaned otherwise.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Removes duplicate directories (by canonical path) and ones that do not exist.
pub(crate) fn existing_unique_dirs(candidates: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = std::collections::BTreeSet::new();
    candidates
        .iter()
        .filter(|dir| dir.is_dir())
        .filter(|dir| seen.insert(normalize_path(dir)))
        .cloned()
        .collect()
}

pub(crate) fn first_existing(candidates: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|path| path.is_file())
}
