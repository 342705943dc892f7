//! Lutris source, one `games/*.yml` config per installed game

use crate::library::{
    existing_unique_dirs, expand_home, first_existing, GameRecord, GameSource, IdentityKey,
    LaunchCommand, LibraryError, SourceTag,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GameSection {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LutrisGameConfig {
    name: Option<String>,
    slug: Option<String>,
    game: Option<GameSection>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LutrisGame {
    pub slug: String,
    pub name: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses one game config. The slug falls back to `file_stem`, the name to the slug.
pub fn parse_game_config(content: &str, file_stem: &str) -> Result<LutrisGame, LibraryError> {
    let config: LutrisGameConfig =
        serde_yaml::from_str(content).map_err(|e| LibraryError::Parse(e.to_string()))?;

    let slug = non_empty(config.slug)
        .or_else(|| non_empty(Some(file_stem.to_string())))
        .ok_or_else(|| LibraryError::Parse("game config without slug".to_string()))?;
    let name = non_empty(config.name)
        .or_else(|| non_empty(config.game.and_then(|game| game.name)))
        .unwrap_or_else(|| slug.clone());

    Ok(LutrisGame { slug, name })
}

pub struct LutrisSource {
    roots: Vec<PathBuf>,
}

impl LutrisSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn default_roots() -> Vec<PathBuf> {
        vec![
            expand_home("~/.local/share/lutris"),
            expand_home("~/.config/lutris"),
        ]
    }

    fn icon_for(&self, roots: &[PathBuf], slug: &str) -> Option<PathBuf> {
        let candidates = roots.iter().flat_map(|root| {
            [
                root.join("banners").join(format!("{}.jpg", slug)),
                root.join("coverart").join(format!("{}.jpg", slug)),
            ]
        });
        first_existing(candidates)
    }
}

fn game_configs(games_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(games_dir) else {
        return Vec::new();
    };
    let mut configs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("yml"))
        })
        .collect();
    configs.sort();
    configs
}

impl GameSource for LutrisSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Lutris
    }

    fn scan(&self, cancel: &CancellationToken) -> Result<Vec<GameRecord>, LibraryError> {
        let roots = existing_unique_dirs(&self.roots);
        let games_dirs: Vec<PathBuf> = roots
            .iter()
            .map(|root| root.join("games"))
            .filter(|dir| dir.is_dir())
            .collect();
        if games_dirs.is_empty() {
            return Err(LibraryError::SourceUnavailable(
                "no Lutris game configs found".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        let mut records = Vec::new();
        for config_path in games_dirs.iter().flat_map(|dir| game_configs(dir)) {
            if cancel.is_cancelled() {
                return Err(LibraryError::Cancelled);
            }

            let stem = config_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let game = match std::fs::read_to_string(&config_path)
                .map_err(LibraryError::from)
                .and_then(|content| parse_game_config(&content, &stem))
            {
                Ok(game) => game,
                Err(e) => {
                    warn!("Skipping Lutris config {}: {}", config_path.display(), e);
                    continue;
                }
            };
            if !seen.insert(game.slug.clone()) {
                debug!("Duplicate Lutris slug {}", game.slug);
                continue;
            }

            records.push(GameRecord {
                id: IdentityKey::lutris(&game.slug),
                icon: self.icon_for(&roots, &game.slug),
                launch: LaunchCommand::new("lutris", [format!("lutris:rungame/{}", game.slug)]),
                name: game.name,
                source: SourceTag::Lutris,
            });
        }

        info!("Found {} Lutris games", records.len());
        Ok(records)
    }
}
