//! Flatpak source
//!
//! Installed apps come from `flatpak list`. Flatpak has no notion of "game",
//! so apps are kept when their id looks like one or their exported desktop
//! file lists the `Game` category.

use crate::library::{
    expand_home, first_existing, GameRecord, GameSource, IdentityKey, LaunchCommand,
    LibraryError, SourceTag,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const GAME_ID_PREFIXES: [&str; 3] = ["com.valvesoftware.", "io.itch.", "net.lutris."];
const GAME_ID_FRAGMENTS: [&str; 3] = ["game", "steam", "itch"];

/// One `application<TAB>name` line of `flatpak list`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatpakApp {
    pub id: String,
    pub name: String,
}

pub fn parse_app_list(output: &str) -> Vec<FlatpakApp> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split('\t').map(str::trim);
            let id = columns.next().filter(|id| !id.is_empty())?;
            let name = columns
                .next()
                .filter(|name| !name.is_empty())
                .unwrap_or(id);
            Some(FlatpakApp {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

pub fn id_looks_like_game(app_id: &str) -> bool {
    let lowered = app_id.to_lowercase();
    GAME_ID_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
        || GAME_ID_FRAGMENTS
            .iter()
            .any(|fragment| lowered.contains(fragment))
}

/// True when a `Categories=` line of the desktop entry contains `Game`.
pub fn desktop_entry_is_game(content: &str) -> bool {
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Categories="))
        .any(|categories| {
            categories
                .split(';')
                .any(|category| category.trim().eq_ignore_ascii_case("game"))
        })
}

pub struct FlatpakSource {
    binary: PathBuf,
    export_roots: Vec<PathBuf>,
}

impl FlatpakSource {
    pub fn new(binary: PathBuf, export_roots: Vec<PathBuf>) -> Self {
        Self {
            binary,
            export_roots,
        }
    }

    pub fn default_export_roots() -> Vec<PathBuf> {
        vec![
            expand_home("~/.local/share/flatpak/exports"),
            PathBuf::from("/var/lib/flatpak/exports"),
        ]
    }

    fn list_apps(&self) -> Result<String, LibraryError> {
        let output = Command::new(&self.binary)
            .args(["list", "--app", "--columns=application,name"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => LibraryError::SourceUnavailable(format!(
                    "{} not installed",
                    self.binary.display()
                )),
                _ => LibraryError::Io(e),
            })?;

        if !output.status.success() {
            return Err(LibraryError::SourceUnavailable(format!(
                "flatpak list failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn is_game(&self, app_id: &str) -> bool {
        if id_looks_like_game(app_id) {
            return true;
        }
        self.export_roots.iter().any(|root| {
            let desktop = root
                .join("share/applications")
                .join(format!("{}.desktop", app_id));
            std::fs::read_to_string(desktop)
                .map(|content| desktop_entry_is_game(&content))
                .unwrap_or(false)
        })
    }

    fn icon_for(&self, app_id: &str) -> Option<PathBuf> {
        let candidates = self.export_roots.iter().flat_map(|root| {
            let hicolor = root.join("share/icons/hicolor");
            [
                icon_file(&hicolor, "256x256", app_id, "png"),
                icon_file(&hicolor, "128x128", app_id, "png"),
                icon_file(&hicolor, "scalable", app_id, "svg"),
            ]
        });
        first_existing(candidates)
    }
}

fn icon_file(hicolor: &Path, size: &str, app_id: &str, extension: &str) -> PathBuf {
    hicolor
        .join(size)
        .join("apps")
        .join(format!("{}.{}", app_id, extension))
}

impl GameSource for FlatpakSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Flatpak
    }

    fn scan(&self, cancel: &CancellationToken) -> Result<Vec<GameRecord>, LibraryError> {
        let listing = self.list_apps()?;

        let mut records = Vec::new();
        for app in parse_app_list(&listing) {
            if cancel.is_cancelled() {
                return Err(LibraryError::Cancelled);
            }
            if !self.is_game(&app.id) {
                debug!("Flatpak app {} does not look like a game", app.id);
                continue;
            }
            records.push(GameRecord {
                id: IdentityKey::flatpak(&app.id),
                icon: self.icon_for(&app.id),
                launch: LaunchCommand::new("flatpak", ["run".to_string(), app.id.clone()]),
                name: app.name,
                source: SourceTag::Flatpak,
            });
        }

        info!("Found {} Flatpak games", records.len());
        Ok(records)
    }
}
