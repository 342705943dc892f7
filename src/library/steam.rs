//! Steam source
//!
//! Reads `libraryfolders.vdf` for additional library folders and every
//! `appmanifest_<appid>.acf` in them. Only the flat `"key" "value"` lines of
//! the KeyValues format are needed, nested blocks are ignored.

use crate::library::{
    existing_unique_dirs, expand_home, first_existing, GameRecord, GameSource, IdentityKey,
    LaunchCommand, LibraryError, SourceTag,
};
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Steamworks Common Redistributables
const REDIST_APPID: &str = "228980";

const SKIPPED_NAME_PREFIXES: [&str; 3] = ["Proton", "Steam Linux Runtime", "Steamworks Common"];

const INSTALL_DIR_ICONS: [&str; 4] = ["logo.png", "header.jpg", "icon.png", "steam_icon.png"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppManifest {
    pub appid: String,
    pub name: String,
    pub installdir: String,
}

impl AppManifest {
    fn is_tool(&self) -> bool {
        self.appid == REDIST_APPID
            || SKIPPED_NAME_PREFIXES
                .iter()
                .any(|prefix| self.name.starts_with(prefix))
    }
}

// Quoted strings on one line, with \" and \\ unescaped
fn quoted_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != '"' {
            continue;
        }
        let mut token = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        token.push(escaped);
                    }
                }
                '"' => {
                    closed = true;
                    break;
                }
                _ => token.push(c),
            }
        }
        if closed {
            tokens.push(token);
        }
    }
    tokens
}

/// All `"key" "value"` pairs in document order, regardless of nesting.
pub fn vdf_pairs(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| {
            let mut tokens = quoted_tokens(line);
            if tokens.len() != 2 {
                return None;
            }
            let value = tokens.pop()?;
            let key = tokens.pop()?;
            Some((key, value))
        })
        .collect()
}

fn first_value(pairs: &[(String, String)], key: &str) -> Option<String> {
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_app_manifest(content: &str) -> Option<AppManifest> {
    let pairs = vdf_pairs(content);
    Some(AppManifest {
        appid: first_value(&pairs, "appid")?,
        name: first_value(&pairs, "name")?,
        installdir: first_value(&pairs, "installdir")?,
    })
}

/// Library root folders listed in `libraryfolders.vdf`.
pub fn parse_library_folders(content: &str) -> Vec<PathBuf> {
    vdf_pairs(content)
        .into_iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case("path"))
        .map(|(_, value)| PathBuf::from(value))
        .collect()
}

fn read_manifest(path: &Path) -> Option<AppManifest> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let manifest = parse_app_manifest(&content);
            if manifest.is_none() {
                warn!("Ignoring incomplete app manifest {}", path.display());
            }
            manifest
        }
        Err(e) => {
            warn!("Cannot read app manifest {}: {}", path.display(), e);
            None
        }
    }
}

fn manifests_in(steamapps: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(steamapps) else {
        return Vec::new();
    };
    let mut manifests: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("appmanifest_") && name.ends_with(".acf"))
        })
        .collect();
    manifests.sort();
    manifests
}

/// Resolves a file inside `…/steamapps/common/<installdir>/…` to the Steam
/// game installed there, if its manifest can be found.
pub fn steam_key_for_path(path: &Path) -> Option<IdentityKey> {
    let components: Vec<Component> = path.components().collect();
    let position = components.windows(2).position(|pair| {
        pair[0].as_os_str() == OsStr::new("steamapps")
            && pair[1].as_os_str() == OsStr::new("common")
    })?;
    let installdir = components.get(position + 2)?.as_os_str().to_str()?;
    let steamapps: PathBuf = components[..=position].iter().collect();

    manifests_in(&steamapps)
        .iter()
        .filter_map(|manifest| read_manifest(manifest))
        .find(|manifest| manifest.installdir == installdir)
        .map(|manifest| IdentityKey::steam(&manifest.appid))
}

pub struct SteamSource {
    roots: Vec<PathBuf>,
}

impl SteamSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn default_roots() -> Vec<PathBuf> {
        vec![expand_home("~/.steam/steam"), expand_home("~/.local/share/Steam")]
    }

    fn library_dirs(&self, roots: &[PathBuf]) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        for root in roots {
            let steamapps = root.join("steamapps");
            candidates.push(steamapps.clone());

            let vdf = steamapps.join("libraryfolders.vdf");
            match std::fs::read_to_string(&vdf) {
                Ok(content) => {
                    for folder in parse_library_folders(&content) {
                        candidates.push(folder.join("steamapps"));
                    }
                }
                Err(e) => debug!("No library folders at {}: {}", vdf.display(), e),
            }
        }
        existing_unique_dirs(&candidates)
    }

    fn icon_for(&self, roots: &[PathBuf], appid: &str, install_dir: &Path) -> Option<PathBuf> {
        let cached = roots.iter().flat_map(|root| {
            let cache = root.join("appcache").join("librarycache");
            [
                cache.join(format!("{}_icon.jpg", appid)),
                cache.join(format!("{}_library_600x900.jpg", appid)),
            ]
        });
        let bundled = INSTALL_DIR_ICONS.iter().map(|name| install_dir.join(name));
        first_existing(cached.chain(bundled))
    }
}

impl GameSource for SteamSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Steam
    }

    fn scan(&self, cancel: &CancellationToken) -> Result<Vec<GameRecord>, LibraryError> {
        let roots = existing_unique_dirs(&self.roots);
        if roots.is_empty() {
            return Err(LibraryError::SourceUnavailable(
                "no Steam installation found".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        let mut records = Vec::new();
        for steamapps in self.library_dirs(&roots) {
            debug!("Scanning Steam library {}", steamapps.display());
            for manifest_path in manifests_in(&steamapps) {
                if cancel.is_cancelled() {
                    return Err(LibraryError::Cancelled);
                }
                let Some(manifest) = read_manifest(&manifest_path) else {
                    continue;
                };
                if manifest.is_tool() {
                    debug!("Skipping Steam tool {} ({})", manifest.name, manifest.appid);
                    continue;
                }
                let install_dir = steamapps.join("common").join(&manifest.installdir);
                if !install_dir.is_dir() {
                    debug!(
                        "Skipping {} ({}), not installed at {}",
                        manifest.name,
                        manifest.appid,
                        install_dir.display()
                    );
                    continue;
                }
                if !seen.insert(manifest.appid.clone()) {
                    continue;
                }

                records.push(GameRecord {
                    id: IdentityKey::steam(&manifest.appid),
                    icon: self.icon_for(&roots, &manifest.appid, &install_dir),
                    launch: LaunchCommand::new(
                        "xdg-open",
                        [format!("steam://rungameid/{}", manifest.appid)],
                    ),
                    name: manifest.name,
                    source: SourceTag::Steam,
                });
            }
        }

        info!("Found {} Steam games", records.len());
        Ok(records)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::install_game;
    use super::*;
    use crate::library::testing::{scratch_dir, write};

    #[test]
    fn manifest_fields_are_read_from_top_level_pairs() {
        let content = r#"
"AppState"
{
	"appid"		"123"
	"name"		"Foo \"Deluxe\""
	"installdir"		"Foo"
}
"#;
        let manifest = parse_app_manifest(content).expect("complete manifest");
        assert_eq!(manifest.appid, "123");
        assert_eq!(manifest.name, "Foo \"Deluxe\"");
        assert_eq!(manifest.installdir, "Foo");
        assert!(parse_app_manifest("\"AppState\" { \"appid\" \"1\" }").is_none());
    }

    #[test]
    fn library_folder_paths_are_unescaped() {
        let content = r#"
"libraryfolders"
{
	"0"
	{
		"path"		"/home/me/.local/share/Steam"
		"label"		""
	}
	"1"
	{
		"path"		"/mnt/games\\steam"
	}
}
"#;
        assert_eq!(
            parse_library_folders(content),
            vec![
                PathBuf::from("/home/me/.local/share/Steam"),
                PathBuf::from("/mnt/games\\steam")
            ]
        );
    }

    #[test]
    fn scan_follows_library_folders_and_skips_tools() {
        let dir = scratch_dir("steam-scan");
        let root = dir.join("Steam");
        let extra = dir.join("extra");
        write(
            &root.join("steamapps/libraryfolders.vdf"),
            &format!("\"libraryfolders\"\n{{\n\t\"1\"\n\t{{\n\t\t\"path\"\t\t\"{}\"\n\t}}\n}}\n", extra.display()),
        );
        install_game(&root.join("steamapps"), "123", "Foo", "Foo");
        install_game(&root.join("steamapps"), "228980", "Steamworks Common Redistributables", "Redist");
        install_game(&root.join("steamapps"), "1493710", "Proton Experimental", "Proton - Experimental");
        install_game(&extra.join("steamapps"), "456", "Bar", "Bar");
        write(&root.join("appcache/librarycache/456_icon.jpg"), "jpg");
        // Manifest without an install dir on disk
        write(
            &root.join("steamapps/appmanifest_789.acf"),
            "\"appid\" \"789\"\n\"name\" \"Gone\"\n\"installdir\" \"Gone\"\n",
        );

        let source = SteamSource::new(vec![root.clone(), root.clone()]);
        let mut records = source.scan(&CancellationToken::new()).expect("scan");
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["steam:123", "steam:456"]);
        assert_eq!(
            records[0].launch,
            LaunchCommand::new("xdg-open", ["steam://rungameid/123"])
        );
        assert_eq!(
            records[1].icon,
            Some(root.join("appcache/librarycache/456_icon.jpg"))
        );

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_roots_are_unavailable() {
        let source = SteamSource::new(vec![PathBuf::from("/nonexistent/controllerlaunch/steam")]);
        assert!(matches!(
            source.scan(&CancellationToken::new()),
            Err(LibraryError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn paths_inside_an_install_dir_resolve_to_the_steam_game() {
        let dir = scratch_dir("steam-resolve");
        let steamapps = dir.join("Steam/steamapps");
        install_game(&steamapps, "123", "Foo", "Foo");

        let exe = steamapps.join("common/Foo/bin/foo");
        assert_eq!(steam_key_for_path(&exe), Some(IdentityKey::steam("123")));
        assert_eq!(steam_key_for_path(&steamapps.join("common/Other/x")), None);
        assert_eq!(steam_key_for_path(Path::new("/usr/bin/foo")), None);

        let _ = std::fs::remove_dir_all(dir);
    }
}
