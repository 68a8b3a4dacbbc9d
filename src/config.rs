//! Configuration for ephemeral-storage

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ephemeral-storage")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for blobs and the metadata index
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Bucket (directory) holding the objects
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Base URL used to build locators handed back to uploaders
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Largest accepted upload in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Accepted content types; `type/*` matches a whole family
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,

    /// Shortest accepted TTL in minutes
    #[serde(default = "default_min_ttl")]
    pub min_ttl_minutes: u32,

    /// Longest accepted TTL in minutes (default one week)
    #[serde(default = "default_max_ttl")]
    pub max_ttl_minutes: u32,

    /// TTL applied when the uploader does not ask for one
    #[serde(default = "default_ttl")]
    pub default_ttl_minutes: u32,

    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Age in days after which objects without a readable expiry stamp are
    /// removed by the sweeper (0 = never)
    #[serde(default = "default_lifecycle_days")]
    pub lifecycle_days: u32,
}

fn default_bucket() -> String {
    "images".to_string()
}

fn default_http_port() -> u16 {
    8090
}

fn default_public_base_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_max_upload_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_allowed_content_types() -> Vec<String> {
    vec!["image/*".to_string()]
}

fn default_min_ttl() -> u32 {
    1
}

fn default_max_ttl() -> u32 {
    10080
}

fn default_ttl() -> u32 {
    1440
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_lifecycle_days() -> u32 {
    7
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            bucket: default_bucket(),
            http_port: default_http_port(),
            public_base_url: default_public_base_url(),
            max_upload_bytes: default_max_upload_bytes(),
            allowed_content_types: default_allowed_content_types(),
            min_ttl_minutes: default_min_ttl(),
            max_ttl_minutes: default_max_ttl(),
            default_ttl_minutes: default_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            lifecycle_days: default_lifecycle_days(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Check settings that would otherwise only fail on first use
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.min_ttl_minutes == 0 {
            return Err(StorageError::Config("min_ttl_minutes must be at least 1".to_string()));
        }
        if self.min_ttl_minutes > self.max_ttl_minutes {
            return Err(StorageError::Config(format!(
                "min_ttl_minutes ({}) exceeds max_ttl_minutes ({})",
                self.min_ttl_minutes, self.max_ttl_minutes
            )));
        }
        if !(self.min_ttl_minutes..=self.max_ttl_minutes).contains(&self.default_ttl_minutes) {
            return Err(StorageError::Config(format!(
                "default_ttl_minutes ({}) is outside {}..={}",
                self.default_ttl_minutes, self.min_ttl_minutes, self.max_ttl_minutes
            )));
        }
        if self.max_upload_bytes == 0 {
            return Err(StorageError::Config("max_upload_bytes must be positive".to_string()));
        }
        if self.allowed_content_types.is_empty() {
            return Err(StorageError::Config("allowed_content_types is empty".to_string()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(StorageError::Config("sweep_interval_secs must be positive".to_string()));
        }
        url::Url::parse(&self.public_base_url).map_err(|e| {
            StorageError::Config(format!("public_base_url {:?}: {}", self.public_base_url, e))
        })?;
        Ok(())
    }

    /// Get blobs directory
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join("blobs")
    }

    /// Get metadata index path
    pub fn metadata_db_path(&self) -> PathBuf {
        self.storage_dir.join("metadata.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Lifecycle backstop window, `None` when disabled
    pub fn lifecycle_window(&self) -> Option<chrono::Duration> {
        (self.lifecycle_days > 0).then(|| chrono::Duration::days(self.lifecycle_days as i64))
    }
}
