//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$ZIMWRITER_CONFIG` (environment variable)
//! 2. `~/.config/zimwriter/config.toml` (Linux/macOS)
//!    `%APPDATA%\zimwriter\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::format::cluster::Compression;

/// Default minimum uncompressed cluster size (1 MiB).
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Archive writer settings.
    pub writer: WriterConfig,
    /// Multi-part output settings.
    pub split: SplitConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
}

/// Archive writer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Seal a cluster once it holds this many uncompressed blob bytes.
    pub min_chunk_size: usize,
    /// Cluster compression: "zlib" or "none".
    pub compression: Compression,
    /// Append a SHA-256 of the archive body.
    pub checksum: bool,
    /// Compress clusters on a worker thread.
    pub background_compression: bool,
    /// Sealed clusters allowed to wait for the worker.
    pub queue_depth: usize,
}

/// Multi-part output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Maximum bytes per part; 0 keeps the archive in one file.
    pub part_size: u64,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            cache_dir: None,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            compression: Compression::Zlib,
            checksum: true,
            background_compression: true,
            queue_depth: 4,
        }
    }
}

impl WriterConfig {
    /// Reject values the writer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize(0));
        }
        Ok(())
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("ZIMWRITER_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("zimwriter").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zimwriter")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("zimwriter.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "warn");
        assert_eq!(cfg.writer.min_chunk_size, DEFAULT_MIN_CHUNK_SIZE);
        assert_eq!(cfg.writer.compression, Compression::Zlib);
        assert!(cfg.writer.checksum);
        assert_eq!(cfg.split.part_size, 0);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.writer, cfg.writer);
        assert_eq!(parsed.general.log_level, cfg.general.log_level);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[writer]
min_chunk_size = 4096
compression = "none"
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.writer.min_chunk_size, 4096);
        assert_eq!(cfg.writer.compression, Compression::None);
        assert!(cfg.writer.checksum);
        assert_eq!(cfg.writer.queue_depth, 4);
        assert_eq!(cfg.general.log_level, "warn");
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let cfg = WriterConfig {
            min_chunk_size: 0,
            ..WriterConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidChunkSize(0)));
    }
}
