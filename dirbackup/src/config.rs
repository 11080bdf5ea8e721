//! Configuration management for the backup tool.
//!
//! Loads configuration from an optional TOML file. Every section and key may be
//! omitted; missing values fall back to the defaults below.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub compression: CompressionConfig,
    pub files: FilesConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compression level passed to zstd (1-19)
    #[serde(default = "default_compression_level")]
    pub level: i32,

    /// Worker threads for external compressors (0 = one per core)
    #[serde(default)]
    pub threads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Ignore-list file name, relative to the source directory
    #[serde(default = "default_ignore_file")]
    pub ignore_file: String,

    /// Ledger file name, relative to the destination directory
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Retention used when the command line omits it (0 = disabled)
    #[serde(default)]
    pub default_days: u32,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_ignore_file() -> String {
    ".backupignore".to_string()
}

fn default_ledger_file() -> String {
    "hash.log".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: default_compression_level(),
            threads: 0,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            ignore_file: default_ignore_file(),
            ledger_file: default_ledger_file(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=19).contains(&self.compression.level) {
            return Err(BackupError::Config(format!(
                "compression.level must be between 1 and 19, got {}",
                self.compression.level
            )));
        }
        for (key, name) in [
            ("files.ignore_file", &self.files.ignore_file),
            ("files.ledger_file", &self.files.ledger_file),
        ] {
            if name.is_empty() || name.contains('/') {
                return Err(BackupError::Config(format!(
                    "{} must be a plain file name, got {:?}",
                    key, name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.compression.level, 3);
        assert_eq!(config.files.ignore_file, ".backupignore");
        assert_eq!(config.files.ledger_file, "hash.log");
        assert_eq!(config.retention.default_days, 0);
    }

    #[test]
    fn test_partial_file() {
        let config = Config::from_toml("[compression]\nlevel = 9\n").unwrap();
        assert_eq!(config.compression.level, 9);
        assert_eq!(config.compression.threads, 0);
        assert_eq!(config.files.ledger_file, "hash.log");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            Config::from_toml("[compression]\nlevel = 40\n"),
            Err(BackupError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[files]\nledger_file = \"../hash.log\"\n"),
            Err(BackupError::Config(_))
        ));
        assert!(Config::from_toml("log = 3").is_err());
    }

    #[test]
    fn test_from_file() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("backup.toml");
        std::fs::write(&path, "[retention]\ndefault_days = 14\n[log]\nlevel = \"debug\"\n")?;

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.retention.default_days, 14);
        assert_eq!(config.log.level, "debug");

        assert!(Config::from_file(&dir.path().join("missing.toml")).is_err());
        Ok(())
    }
}
