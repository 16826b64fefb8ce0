//! Configuration system using TOML files.
//!
//! Config is stored in the OS-standard config directory:
//! - Windows: %APPDATA%\songstream\config.toml
//! - macOS: ~/Library/Application Support/songstream/config.toml
//! - Linux: ~/.config/songstream/config.toml
//!
//! An explicit path can be given on the command line instead. Every field has
//! a default, so a partial file (or none at all) is always usable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stream::Framing;

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and reactor settings
    pub server: ServerConfig,

    /// Where the catalog and credentials live
    pub storage: StorageConfig,

    /// Registration rules
    pub accounts: AccountsConfig,

    /// Audio stream pacing and framing
    pub streaming: StreamingConfig,
}

/// Listener and reactor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    /// TCP port to listen on
    pub port: u16,

    /// Longest accepted command line in bytes
    pub max_line_length: usize,

    /// Upper bound on simultaneously active streams
    pub max_concurrent_streams: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7777,
            max_line_length: 1024,
            max_concurrent_streams: 64,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Catalog and credential file locations.
///
/// Relative file names are resolved against `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub songs_file: PathBuf,
    pub playlists_file: PathBuf,
    pub index_file: PathBuf,
    pub credentials_file: PathBuf,
    pub stopwords_file: PathBuf,
    /// Directory holding `<artist> - <title> - <duration>.wav` files
    pub songs_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("resources"),
            songs_file: PathBuf::from("media/songs.json"),
            playlists_file: PathBuf::from("media/playlists.json"),
            index_file: PathBuf::from("media/index.json"),
            credentials_file: PathBuf::from("authentication/users.csv"),
            stopwords_file: PathBuf::from("stopwords.txt"),
            songs_dir: PathBuf::from("songs"),
        }
    }
}

impl StorageConfig {
    /// Storage rooted at `data_dir` with the default layout.
    pub fn rooted(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn resolve(&self, file: &Path) -> PathBuf {
        self.data_dir.join(file)
    }

    pub fn songs_path(&self) -> PathBuf {
        self.resolve(&self.songs_file)
    }

    pub fn playlists_path(&self) -> PathBuf {
        self.resolve(&self.playlists_file)
    }

    pub fn index_path(&self) -> PathBuf {
        self.resolve(&self.index_file)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.resolve(&self.credentials_file)
    }

    pub fn stopwords_path(&self) -> PathBuf {
        self.resolve(&self.stopwords_file)
    }

    pub fn songs_dir_path(&self) -> PathBuf {
        self.resolve(&self.songs_dir)
    }
}

/// Registration rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Regular expression an email must match to be registered
    pub email_pattern: String,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            email_pattern: r"^[\w.+-]+@[\w-]+(\.[\w-]+)+$".to_string(),
        }
    }
}

/// Audio stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Bytes of PCM data per chunk
    pub chunk_size: usize,

    /// Delay after each chunk so the receiver's decode buffer keeps up
    pub pacing_ms: u64,

    /// A chunk write taking longer than this fails the stream
    pub write_timeout_ms: u64,

    /// Wire framing for audio chunks
    pub framing: Framing,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            pacing_ms: 20,
            write_timeout_ms: 10_000,
            framing: Framing::default(),
        }
    }
}

impl StreamingConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("songstream"))
}

/// Get the full path to the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Load configuration from `path`, or from the OS config directory.
///
/// Returns default config if file doesn't exist or can't be parsed.
/// Logs warnings but doesn't fail - we always return a usable config.
pub fn load(path: Option<&Path>) -> Config {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_path) else {
        tracing::warn!(target: "config", "Could not determine config directory, using defaults");
        return Config::default();
    };

    if !path.exists() {
        tracing::info!(target: "config", "No config file found at {:?}, using defaults", path);
        return Config::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::info!(target: "config", "Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                tracing::error!(target: "config", "Failed to parse config file {:?}: {}", path, e);
                tracing::warn!(target: "config", "Using default configuration");
                Config::default()
            }
        },
        Err(e) => {
            tracing::error!(target: "config", "Failed to read config file {:?}: {}", path, e);
            Config::default()
        }
    }
}

/// Save configuration to `path`
///
/// Creates the parent directory if it doesn't exist.
pub fn save(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDir(dir.to_path_buf(), e))?;
    }

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    // Write atomically (write to temp, then rename)
    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| ConfigError::Rename(temp_path, path.to_path_buf(), e))?;

    tracing::info!(target: "config", "Saved config to {:?}", path);
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to create config directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("Failed to write config to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Failed to rename temp file {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[storage]"));
        assert!(toml.contains("[accounts]"));
        assert!(toml.contains("[streaming]"));
        assert!(toml.contains("framing = \"length-prefixed\""));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml = r#"
[server]
port = 9000

[streaming]
framing = "legacy"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.streaming.framing, Framing::Legacy);

        // Other fields use defaults
        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.streaming.chunk_size, 4096);
        assert_eq!(config.storage.data_dir, PathBuf::from("resources"));
    }

    #[test]
    fn test_storage_paths_resolve_under_data_dir() {
        let storage = StorageConfig::rooted("/srv/music");
        assert_eq!(
            storage.songs_path(),
            PathBuf::from("/srv/music/media/songs.json")
        );
        assert_eq!(
            storage.credentials_path(),
            PathBuf::from("/srv/music/authentication/users.csv")
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.server.port = 4242;
        config.streaming.pacing_ms = 5;
        save(&config, &path).unwrap();

        let loaded = load(Some(&path));
        assert_eq!(loaded.server.port, 4242);
        assert_eq!(loaded.streaming.pacing(), Duration::from_millis(5));
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "server = [not toml").unwrap();

        let loaded = load(Some(&path));
        assert_eq!(loaded.server.port, 7777);
    }
}
