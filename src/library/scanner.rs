//! Library Scanner - runs every source concurrently, each under its own timeout
//!
//! ```text
//!            ┌─► Steam   ─┐
//! scan_cycle ├─► Flatpak ─┤   spawn_blocking + timeout each
//!            ├─► Lutris  ─┤   a failing source only loses its own records
//!            └─► Custom  ─┘
//! ```

use crate::library::custom::CustomSource;
use crate::library::flatpak::FlatpakSource;
use crate::library::lutris::LutrisSource;
use crate::library::steam::SteamSource;
use crate::library::{expand_home, GameRecord, GameSource, IdentityKey, LibraryError, SourceTag};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The `[library]` config section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    /// Steam installation roots; empty means the usual locations
    pub steam_roots: Vec<String>,
    /// Lutris data roots; empty means the usual locations
    pub lutris_roots: Vec<String>,
    pub flatpak_binary: String,

    pub custom_paths: Vec<String>,
    /// Executable path to identity key, e.g. `"/opt/foo/run" = "steam:123"`
    pub custom_aliases: BTreeMap<String, String>,
    pub custom_max_depth: usize,
    pub custom_max_entries: usize,

    pub scan_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub recent_cap: usize,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            steam_roots: Vec::new(),
            lutris_roots: Vec::new(),
            flatpak_binary: "flatpak".to_string(),
            custom_paths: Vec::new(),
            custom_aliases: BTreeMap::new(),
            custom_max_depth: 4,
            custom_max_entries: 100,
            scan_timeout_secs: 10,
            refresh_interval_secs: 300,
            recent_cap: 20,
        }
    }
}

impl LibrarySettings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    fn roots_or(configured: &[String], defaults: Vec<PathBuf>) -> Vec<PathBuf> {
        if configured.is_empty() {
            defaults
        } else {
            configured.iter().map(|root| expand_home(root)).collect()
        }
    }

    fn aliases(&self) -> HashMap<PathBuf, IdentityKey> {
        self.custom_aliases
            .iter()
            .filter_map(|(path, key)| match IdentityKey::parse(key) {
                Ok(key) => Some((expand_home(path), key)),
                Err(e) => {
                    warn!("Ignoring alias for {}: {}", path, e);
                    None
                }
            })
            .collect()
    }
}

/// How one source fared in a scan cycle.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source: SourceTag,
    /// Number of records contributed, or why there are none
    pub result: Result<usize, LibraryError>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub records: Vec<GameRecord>,
    pub outcomes: Vec<SourceOutcome>,
}

impl ScanReport {
    pub fn outcome(&self, source: SourceTag) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|outcome| outcome.source == source)
    }
}

pub struct LibraryScanner {
    sources: Vec<Arc<dyn GameSource>>,
    timeout: Duration,
}

impl LibraryScanner {
    pub fn new(sources: Vec<Arc<dyn GameSource>>, timeout: Duration) -> Self {
        Self { sources, timeout }
    }

    pub fn from_settings(settings: &LibrarySettings) -> Self {
        let steam = SteamSource::new(LibrarySettings::roots_or(
            &settings.steam_roots,
            SteamSource::default_roots(),
        ));
        let flatpak = FlatpakSource::new(
            PathBuf::from(&settings.flatpak_binary),
            FlatpakSource::default_export_roots(),
        );
        let lutris = LutrisSource::new(LibrarySettings::roots_or(
            &settings.lutris_roots,
            LutrisSource::default_roots(),
        ));
        let custom = CustomSource::new(
            settings.custom_paths.iter().map(|p| expand_home(p)).collect(),
            settings.aliases(),
            settings.custom_max_depth,
            settings.custom_max_entries,
        );

        Self::new(
            vec![
                Arc::new(steam) as Arc<dyn GameSource>,
                Arc::new(flatpak),
                Arc::new(lutris),
                Arc::new(custom),
            ],
            settings.scan_timeout(),
        )
    }

    /// Runs one scan of every source. Never fails as a whole; per-source
    /// problems end up in [`ScanReport::outcomes`].
    pub async fn scan_cycle(&self, cancel: &CancellationToken) -> ScanReport {
        info!("Starting library scan of {} sources", self.sources.len());
        let mut tasks = JoinSet::new();

        for (index, source) in self.sources.iter().enumerate() {
            let source = source.clone();
            let token = cancel.child_token();
            let timeout = self.timeout;

            tasks.spawn(async move {
                let started = Instant::now();
                let tag = source.tag();
                let scan_token = token.clone();
                let work = tokio::task::spawn_blocking(move || source.scan(&scan_token));

                let result = tokio::select! {
                    _ = token.cancelled() => Err(LibraryError::Cancelled),
                    joined = tokio::time::timeout(timeout, work) => match joined {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => Err(LibraryError::SourceUnavailable(format!(
                            "scan task failed: {}",
                            e
                        ))),
                        Err(_) => {
                            // Lets the abandoned scan stop at its next check
                            token.cancel();
                            Err(LibraryError::SourceTimeout(tag, timeout))
                        }
                    },
                };
                (index, tag, result, started.elapsed())
            });
        }

        let mut finished = Vec::with_capacity(self.sources.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => finished.push(entry),
                Err(e) => warn!("Scan task panicked: {}", e),
            }
        }
        finished.sort_by_key(|(index, ..)| *index);

        let mut report = ScanReport::default();
        for (_, source, result, elapsed) in finished {
            let result = match result {
                Ok(records) => {
                    debug!("{} contributed {} records in {:?}", source, records.len(), elapsed);
                    let count = records.len();
                    report.records.extend(records);
                    Ok(count)
                }
                Err(e) => {
                    match &e {
                        LibraryError::SourceUnavailable(reason) => {
                            info!("{} unavailable: {}", source, reason)
                        }
                        other => warn!("{} scan failed: {}", source, other),
                    }
                    Err(e)
                }
            };
            report.outcomes.push(SourceOutcome {
                source,
                result,
                elapsed,
            });
        }

        info!("Library scan finished with {} records", report.records.len());
        report
    }
}
