// Store configuration, constructed once and passed to every component

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::constants::*;
use crate::core::error::{Result, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the chunk files.
    pub data_root: PathBuf,
    /// SQLite catalog file.
    pub database_path: PathBuf,
    pub chunk_span_secs: u64,
    pub oversampling_threshold: f64,
    pub default_max_points: usize,
    pub compression: CompressionType,
    pub workers: usize,
    /// How many empty parent directories a delete may remove.
    pub cleanup_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/chunks"),
            database_path: PathBuf::from("data/physio.sqlite3"),
            chunk_span_secs: DEFAULT_CHUNK_SPAN_SECS,
            oversampling_threshold: DEFAULT_OVERSAMPLING_THRESHOLD,
            default_max_points: DEFAULT_MAX_POINTS,
            compression: CompressionType::default(),
            workers: DEFAULT_WORKERS,
            cleanup_depth: DEFAULT_CLEANUP_DEPTH,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_span_secs == 0 {
            return Err(StoreError::config("chunk_span_secs must be positive"));
        }
        if !self.oversampling_threshold.is_finite() || self.oversampling_threshold <= 1.0 {
            return Err(StoreError::config(format!(
                "oversampling_threshold must be a finite value above 1, got {}",
                self.oversampling_threshold
            )));
        }
        if self.default_max_points <= 1 {
            return Err(StoreError::config("default_max_points must be at least 2"));
        }
        if self.workers == 0 {
            return Err(StoreError::config("workers must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_span_secs, 3600);
        assert_eq!(config.default_max_points, 2000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"chunk_span_secs": 60, "compression": "none"}"#).unwrap();
        assert_eq!(config.chunk_span_secs, 60);
        assert_eq!(config.compression, CompressionType::None);
        assert_eq!(config.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn test_validate_rejects() {
        let bad = [
            StoreConfig { chunk_span_secs: 0, ..StoreConfig::default() },
            StoreConfig { oversampling_threshold: 1.0, ..StoreConfig::default() },
            StoreConfig { oversampling_threshold: f64::NAN, ..StoreConfig::default() },
            StoreConfig { default_max_points: 1, ..StoreConfig::default() },
            StoreConfig { workers: 0, ..StoreConfig::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(StoreError::Configuration(_))));
        }
    }
}
