//! User-configured paths
//!
//! A listed file is one game. A listed directory is walked for executable
//! files, each becoming a game named after the directory it sits in.

use crate::library::steam::steam_key_for_path;
use crate::library::{
    existing_unique_dirs, first_existing, normalize_path, GameRecord, GameSource, IdentityKey,
    LaunchCommand, LibraryError, SourceTag,
};
use std::collections::{BTreeSet, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const HELPER_BINARIES: [&str; 11] = [
    "steam",
    "lutris",
    "flatpak",
    "python",
    "python3",
    "sh",
    "bash",
    "xdg-open",
    "UnityCrashHandler32",
    "UnityCrashHandler64",
    "crashpad_handler",
];

const ICON_NAMES: [&str; 4] = ["icon.png", "icon.jpg", "logo.png", "logo.jpg"];

pub struct CustomSource {
    paths: Vec<PathBuf>,
    aliases: HashMap<PathBuf, IdentityKey>,
    max_depth: usize,
    max_entries: usize,
}

impl CustomSource {
    /// `aliases` map a file (normalized on the way in) to the key it should merge under.
    pub fn new(
        paths: Vec<PathBuf>,
        aliases: HashMap<PathBuf, IdentityKey>,
        max_depth: usize,
        max_entries: usize,
    ) -> Self {
        let aliases = aliases
            .into_iter()
            .map(|(path, key)| (normalize_path(&path), key))
            .collect();
        Self {
            paths,
            aliases,
            max_depth,
            max_entries,
        }
    }

    fn identity_for(&self, path: &Path) -> IdentityKey {
        let normalized = normalize_path(path);
        if let Some(alias) = self.aliases.get(&normalized) {
            return alias.clone();
        }
        steam_key_for_path(&normalized).unwrap_or_else(|| IdentityKey::custom(&normalized))
    }

    fn record(&self, executable: &Path, name: String) -> GameRecord {
        let icon = executable
            .parent()
            .and_then(|dir| first_existing(ICON_NAMES.iter().map(|icon| dir.join(icon))));
        GameRecord {
            id: self.identity_for(executable),
            name,
            icon,
            launch: LaunchCommand::new(executable.to_string_lossy(), Vec::<String>::new()),
            source: SourceTag::Custom,
        }
    }

    fn walk(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
        records: &mut Vec<GameRecord>,
    ) -> Result<(), LibraryError> {
        let mut found = 0;
        let walker = WalkDir::new(dir)
            .max_depth(self.max_depth)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if cancel.is_cancelled() {
                return Err(LibraryError::Cancelled);
            }
            if !entry.file_type().is_file() || !is_candidate(entry.path()) {
                continue;
            }
            if found >= self.max_entries {
                warn!(
                    "Too many executables under {}, stopping after {}",
                    dir.display(),
                    self.max_entries
                );
                break;
            }

            let name = entry
                .path()
                .parent()
                .and_then(|parent| parent.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.file_name().to_string_lossy().into_owned());
            records.push(self.record(entry.path(), name));
            found += 1;
        }
        debug!("{} executables under {}", found, dir.display());
        Ok(())
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn is_candidate(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    let shared_object = file_name.ends_with(".so") || file_name.contains(".so.");
    !shared_object && !HELPER_BINARIES.contains(&file_name) && is_executable(path)
}

impl GameSource for CustomSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Custom
    }

    fn scan(&self, cancel: &CancellationToken) -> Result<Vec<GameRecord>, LibraryError> {
        let files: Vec<&PathBuf> = self.paths.iter().filter(|path| path.is_file()).collect();
        let dirs = existing_unique_dirs(&self.paths);
        if files.is_empty() && dirs.is_empty() {
            return Err(LibraryError::SourceUnavailable(
                "no custom game paths exist".to_string(),
            ));
        }

        let mut records = Vec::new();
        for file in files {
            if cancel.is_cancelled() {
                return Err(LibraryError::Cancelled);
            }
            if !is_executable(file) {
                warn!("Custom game {} is not executable", file.display());
                continue;
            }
            let name = file
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            records.push(self.record(file, name));
        }
        for dir in dirs {
            self.walk(&dir, cancel, &mut records)?;
        }

        let mut seen = BTreeSet::new();
        records.retain(|record| seen.insert(record.id.clone()));

        info!("Found {} custom games", records.len());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::steam::testing::install_game;
    use crate::library::testing::{scratch_dir, write, write_executable};

    fn source(paths: Vec<PathBuf>) -> CustomSource {
        CustomSource::new(paths, HashMap::new(), 4, 100)
    }

    #[test]
    fn executables_are_named_after_their_directory() {
        let dir = scratch_dir("custom-walk");
        write_executable(&dir.join("Hollow Knight/hollow_knight"));
        write(&dir.join("Hollow Knight/icon.png"), "png");
        write(&dir.join("Hollow Knight/readme.txt"), "not executable");
        write_executable(&dir.join("Hollow Knight/libmono.so"));
        write_executable(&dir.join("Hollow Knight/UnityCrashHandler64"));

        let records = source(vec![dir.clone()])
            .scan(&CancellationToken::new())
            .expect("scan");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Hollow Knight");
        assert_eq!(records[0].source, SourceTag::Custom);
        assert_eq!(records[0].icon, Some(dir.join("Hollow Knight/icon.png")));
        assert_eq!(
            records[0].id,
            IdentityKey::custom(&dir.join("Hollow Knight/hollow_knight"))
        );

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn walk_honors_depth_and_entry_cap() {
        let dir = scratch_dir("custom-cap");
        for i in 0..5 {
            write_executable(&dir.join(format!("game{}/run", i)));
        }
        write_executable(&dir.join("a/b/c/d/e/too_deep"));

        let records = CustomSource::new(vec![dir.clone()], HashMap::new(), 4, 3)
            .scan(&CancellationToken::new())
            .expect("scan");
        assert_eq!(records.len(), 3);

        let records = source(vec![dir.clone()])
            .scan(&CancellationToken::new())
            .expect("scan");
        assert_eq!(records.len(), 5);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn listed_files_use_their_stem() {
        let dir = scratch_dir("custom-file");
        let exe = dir.join("doom.sh");
        write_executable(&exe);

        let records = source(vec![exe]).scan(&CancellationToken::new()).expect("scan");
        assert_eq!(records[0].name, "doom");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn steam_install_dirs_and_aliases_resolve_to_other_keys() {
        let dir = scratch_dir("custom-resolve");
        let steamapps = dir.join("Steam/steamapps");
        install_game(&steamapps, "123", "Foo", "Foo");
        let inside_steam = steamapps.join("common/Foo/foo.x86_64");
        write_executable(&inside_steam);
        let aliased = dir.join("Bar/bar");
        write_executable(&aliased);

        let aliases = HashMap::from([(aliased.clone(), IdentityKey::lutris("bar"))]);
        let source = CustomSource::new(vec![inside_steam, aliased], aliases, 4, 100);
        let mut ids: Vec<_> = source
            .scan(&CancellationToken::new())
            .expect("scan")
            .into_iter()
            .map(|record| record.id)
            .collect();
        ids.sort();

        assert_eq!(ids, vec![IdentityKey::lutris("bar"), IdentityKey::steam("123")]);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn nothing_configured_is_unavailable() {
        assert!(matches!(
            source(Vec::new()).scan(&CancellationToken::new()),
            Err(LibraryError::SourceUnavailable(_))
        ));
    }
}
