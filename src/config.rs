//! Daemon configuration
//!
//! Everything lives under one directory, `~/.config/controllerlaunch` unless
//! overridden on the command line:
//!
//! ```text
//! config.toml    [controller] [library] [ipc]
//! bindings.toml  [[binding]] entries
//! recent.toml    recently launched identity keys
//! ```
//!
//! Each section of `config.toml` is parsed on its own. A section that does not
//! parse is replaced by its defaults without taking the others down with it.

use crate::controller::ControllerSettings;
use crate::ipc::IpcSettings;
use crate::library::scanner::LibrarySettings;
use crate::persistence::recent::RECENT_FILE;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const APP_DIR: &str = "controllerlaunch";
pub const CONFIG_FILE: &str = "config.toml";
pub const BINDINGS_FILE: &str = "bindings.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed config: {0}")]
    Malformed(String),

    #[error("No config directory available, pass --config-dir")]
    NoConfigDir,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppConfig {
    pub controller: ControllerSettings,
    pub library: LibrarySettings,
    pub ipc: IpcSettings,
}

fn section<T: DeserializeOwned + Default>(table: &toml::Table, name: &str) -> T {
    let Some(value) = table.get(name) else {
        debug!("No [{}] section, using defaults", name);
        return T::default();
    };
    match value.clone().try_into::<T>() {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Ignoring malformed [{}] section: {}", name, e);
            T::default()
        }
    }
}

impl AppConfig {
    /// Parses `config.toml`. Only a file that is not TOML at all is an error.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table =
            toml::from_str(content).map_err(|e| ConfigError::Malformed(e.to_string()))?;

        for key in table.keys() {
            if !matches!(key.as_str(), "controller" | "library" | "ipc") {
                warn!("Unknown config section [{}]", key);
            }
        }

        Ok(Self {
            controller: section(&table, "controller"),
            library: section(&table, "library"),
            ipc: section(&table, "ipc"),
        })
    }

    /// Loads the config file; missing or unparseable files give the defaults.
    pub async fn load(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("{} ({}), using defaults", ConfigError::Io(e), path.display());
                return Self::default();
            }
        };

        match Self::from_toml_str(&content) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("{} ({}), using defaults", e, path.display());
                Self::default()
            }
        }
    }
}

/// Locations of the files the daemon reads and writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigPaths {
    pub dir: PathBuf,
}

impl ConfigPaths {
    pub fn resolve(override_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let dir = match override_dir {
            Some(dir) => dir,
            None => dirs::config_dir()
                .ok_or(ConfigError::NoConfigDir)?
                .join(APP_DIR),
        };
        Ok(Self { dir })
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn bindings_file(&self) -> PathBuf {
        self.dir.join(BINDINGS_FILE)
    }

    pub fn recent_file(&self) -> PathBuf {
        self.dir.join(RECENT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(AppConfig::from_toml_str("").unwrap(), AppConfig::default());
    }

    #[test]
    fn malformed_section_falls_back_alone() {
        let content = r#"
            [controller]
            long_press_ms = "very long"

            [library]
            custom_paths = ["/opt/games"]
            recent_cap = 5

            [ipc]
            listener_queue = 8
        "#;
        let config = AppConfig::from_toml_str(content).unwrap();

        assert_eq!(config.controller, ControllerSettings::default());
        assert_eq!(config.library.custom_paths, vec!["/opt/games".to_string()]);
        assert_eq!(config.library.recent_cap, 5);
        assert_eq!(config.library.scan_timeout_secs, 10);
        assert_eq!(config.ipc.listener_queue, 8);
    }

    #[test]
    fn not_toml_is_an_error() {
        assert!(matches!(
            AppConfig::from_toml_str("[controller"),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/controllerlaunch/config.toml")).await;
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn paths_follow_the_override() {
        let paths = ConfigPaths::resolve(Some(PathBuf::from("/tmp/cl"))).unwrap();
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/cl/config.toml"));
        assert_eq!(paths.bindings_file(), PathBuf::from("/tmp/cl/bindings.toml"));
        assert_eq!(paths.recent_file(), PathBuf::from("/tmp/cl/recent.toml"));
    }
}
