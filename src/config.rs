//! Engine Configuration
//!
//! Retrieval engine settings stored in TOML format. One `EngineConfig` is
//! built per process and handed to [`crate::engine::TextRetriever`]; there
//! is no module-level global state.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::hashing::HashKind;
use crate::provider::{DEFAULT_OCR_URL, DEFAULT_TIMEOUT_SECS};
use crate::storage::artifacts::DEFAULT_CORRELATION_THRESHOLD;

/// Retrieval engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for cache and temp files. The cache index and
    /// artifacts live under `<output_dir>/cache/`, ephemeral captures
    /// under `<output_dir>/temp/`.
    pub output_dir: PathBuf,
    /// OCR provider endpoint.
    pub ocr_url: String,
    /// Provider request timeout in seconds.
    pub ocr_timeout_secs: u64,
    /// Downscale probes wider than `max_width` before hashing/recognition.
    pub resize_image: bool,
    /// Maximum probe width when `resize_image` is set.
    pub max_width: u32,
    /// Remove internally captured screenshots on every exit path.
    pub delete_temp_screenshots: bool,
    /// Entry count that triggers eviction of the oldest cache entries.
    pub max_cache_size: usize,
    /// Hash algorithm used for near-duplicate lookup.
    pub hash_kind: HashKind,
    /// Maximum Hamming distance for a near-duplicate cache hit.
    pub hash_threshold: u32,
    /// Minimum correlation score for the legacy pixel fallback.
    pub pixel_correlation_threshold: f32,
    /// Master switch for the cache; disabled means every search goes to
    /// the provider.
    pub use_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            ocr_url: DEFAULT_OCR_URL.to_string(),
            ocr_timeout_secs: DEFAULT_TIMEOUT_SECS,
            resize_image: false,
            max_width: 1280,
            delete_temp_screenshots: true,
            max_cache_size: 500,
            hash_kind: HashKind::Perceptual,
            hash_threshold: 5,
            pixel_correlation_threshold: DEFAULT_CORRELATION_THRESHOLD,
            use_cache: true,
        }
    }
}

impl EngineConfig {
    /// Cache directory (index + artifacts).
    pub fn cache_dir(&self) -> PathBuf {
        self.output_dir.join("cache")
    }

    /// Index store file.
    pub fn index_path(&self) -> PathBuf {
        self.cache_dir().join("cache.db")
    }

    /// Directory for ephemeral capture files.
    pub fn temp_dir(&self) -> PathBuf {
        self.output_dir.join("temp")
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: EngineConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &EngineConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();

        assert_eq!(config.ocr_url, "http://localhost:8080/ocr");
        assert_eq!(config.ocr_timeout_secs, 30);
        assert!(!config.resize_image);
        assert!(config.delete_temp_screenshots);
        assert_eq!(config.max_cache_size, 500);
        assert_eq!(config.hash_kind, HashKind::Perceptual);
        assert_eq!(config.hash_threshold, 5);
        assert!((config.pixel_correlation_threshold - 0.95).abs() < 1e-6);
        assert!(config.use_cache);
    }

    #[test]
    fn test_derived_paths() {
        let config = EngineConfig {
            output_dir: PathBuf::from("/srv/bot"),
            ..Default::default()
        };
        assert_eq!(config.cache_dir(), PathBuf::from("/srv/bot/cache"));
        assert_eq!(config.index_path(), PathBuf::from("/srv/bot/cache/cache.db"));
        assert_eq!(config.temp_dir(), PathBuf::from("/srv/bot/temp"));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = EngineConfig::default();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.ocr_url, parsed.ocr_url);
        assert_eq!(config.hash_kind, parsed.hash_kind);
        assert_eq!(config.max_cache_size, parsed.max_cache_size);
    }

    #[test]
    fn test_hash_kind_serializes_snake_case() {
        let mut config = EngineConfig::default();
        config.hash_kind = HashKind::Difference;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("hash_kind = \"difference\""));
    }

    #[test]
    fn test_save_and_load_config() {
        let config = EngineConfig {
            max_cache_size: 42,
            ..Default::default()
        };

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(loaded.max_cache_size, 42);
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();
        assert!(load_config(temp_file.path()).is_err());
    }
}
