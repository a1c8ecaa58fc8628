//! Engine configuration for wharf
//!
//! Located at `~/.config/wharf/config.toml`. `WHARF_CONFIG_DIR` overrides the
//! directory and `WHARF_ROOT` overrides the state root.

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Image name that maps to the host filesystem
pub const HOST_IMAGE: &str = "host";

/// Global wharf configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub streams: StreamsConfig,
    pub tty: TtyConfig,
    /// Image name -> root filesystem path
    pub images: ImagesConfig,
}

/// Where the engine keeps its state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// State root. Containers live under `<root>/containers/<id>/`.
    /// Empty means the platform data directory.
    pub root: Option<PathBuf>,
}

/// Stream multiplexer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Chunks buffered per attached consumer before it is detached
    pub fanout_buffer: usize,
    /// Bytes read from a process stream at a time
    pub read_chunk_size: usize,
    /// How long the supervisor waits for output to drain after exit
    pub drain_timeout_ms: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            fanout_buffer: 64,
            read_chunk_size: 32 * 1024,
            drain_timeout_ms: 2000,
        }
    }
}

impl StreamsConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Initial pseudo-terminal window size for tty containers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TtyConfig {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TtyConfig {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Known images. Image storage is external; this table only resolves a name
/// to the root filesystem a process is started in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImagesConfig(pub BTreeMap<String, PathBuf>);

impl Default for ImagesConfig {
    fn default() -> Self {
        let mut images = BTreeMap::new();
        images.insert(HOST_IMAGE.to_string(), PathBuf::from("/"));
        Self(images)
    }
}

impl ImagesConfig {
    /// Root filesystem for an image, if the image is known
    pub fn rootfs(&self, image: &str) -> Option<&Path> {
        self.0.get(image).map(PathBuf::as_path)
    }

    pub fn insert(&mut self, name: impl Into<String>, rootfs: impl Into<PathBuf>) {
        self.0.insert(name.into(), rootfs.into());
    }
}

impl EngineConfig {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;

        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.streams.fanout_buffer == 0 {
            return Err(ConfigError::Invalid(
                "streams.fanout_buffer must be at least 1".to_string(),
            ));
        }
        if self.streams.read_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "streams.read_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.tty.rows == 0 || self.tty.cols == 0 {
            return Err(ConfigError::Invalid(
                "tty.rows and tty.cols must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved state root
    pub fn root_dir(&self) -> Result<PathBuf> {
        if let Ok(root) = std::env::var("WHARF_ROOT") {
            if !root.is_empty() {
                return Ok(PathBuf::from(root));
            }
        }
        match &self.engine.root {
            Some(root) => Ok(root.clone()),
            None => Self::data_dir(),
        }
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("WHARF_CONFIG_DIR") {
            if !dir.is_empty() {
                return Ok(PathBuf::from(dir).join("config.toml"));
            }
        }
        let dirs = ProjectDirs::from("", "", "wharf").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "wharf").ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}
