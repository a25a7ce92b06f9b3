//! Configuration management for catalog-index
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (catalog.toml)
//! - Environment variables (CATALOG__*)
//!
//! ## Example config file (catalog.toml):
//! ```toml
//! [store]
//! path = "./index.db"
//!
//! [index]
//! container_tool = "podman"
//! binary_source_image = "quay.io/operator-framework/upstream-registry-builder"
//! database_path = "/database/index.db"
//! timeout_secs = 600
//!
//! [merge]
//! permissive = false
//! overwrite = false
//!
//! [export]
//! minimal = true
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::index::{Cancellation, ContainerTool, ExportOptions, DEFAULT_BINARY_IMAGE, DEFAULT_DATABASE_PATH};
use crate::merge::MergeOptions;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub export: ExportConfig,
}

/// Local store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store file used by the `registry` commands
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Image build settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub container_tool: ContainerTool,

    /// Registry-serving base of every index image
    #[serde(default = "default_binary_image")]
    pub binary_source_image: String,

    /// Store path inside index images
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Where generate-only runs write the Dockerfile
    #[serde(default)]
    pub out_dockerfile: Option<PathBuf>,

    /// Deadline for one index operation; none when unset
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub permissive: bool,

    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub minimal: bool,
}

// Default value functions
fn default_store_path() -> PathBuf {
    PathBuf::from("index.db")
}

fn default_binary_image() -> String {
    DEFAULT_BINARY_IMAGE.to_string()
}

fn default_database_path() -> String {
    DEFAULT_DATABASE_PATH.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            container_tool: ContainerTool::default(),
            binary_source_image: default_binary_image(),
            database_path: default_database_path(),
            out_dockerfile: None,
            timeout_secs: None,
        }
    }
}

impl CatalogConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, with `config_path` (if any) overriding the
    /// default locations
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["catalog.toml", ".catalog.toml", "config/catalog.toml"];
        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(dirs) = directories::ProjectDirs::from("dev", "familiar", "catalog-index") {
            let xdg_config = dirs.config_dir().join("catalog.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // CATALOG__INDEX__CONTAINER_TOOL=podman
        builder = builder.add_source(
            Environment::with_prefix("CATALOG")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Store path (resolves relative paths)
    pub fn store_path(&self) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.store.path)
        }
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            permissive: self.merge.permissive,
            overwrite: self.merge.overwrite,
            generate_only: false,
        }
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            minimal: self.export.minimal,
        }
    }

    /// Fresh cancellation token carrying the configured deadline
    pub fn cancellation(&self) -> Cancellation {
        match self.index.timeout_secs {
            Some(secs) => Cancellation::with_timeout(Duration::from_secs(secs)),
            None => Cancellation::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = CatalogConfig::default();
        assert_eq!(config.index.container_tool, ContainerTool::Docker);
        assert_eq!(config.index.database_path, "/database/index.db");
        assert!(!config.merge_options().permissive);
    }

    #[test]
    fn test_serialize_config() {
        let config = CatalogConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[store]"));
        assert!(toml_str.contains("[index]"));
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        let mut config = CatalogConfig::default();
        config.index.container_tool = ContainerTool::Podman;
        config.merge.permissive = true;
        config.index.timeout_secs = Some(30);
        config.save(&path).unwrap();

        let loaded = CatalogConfig::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.index.container_tool, ContainerTool::Podman);
        assert!(loaded.merge_options().permissive);
        assert!(loaded.cancellation().remaining().is_some());
    }
}
