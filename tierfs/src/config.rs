//! tierfs configuration
//!
//! Loaded from YAML; every section falls back to defaults when omitted.

use crate::cadapter::s3::S3Config;
use crate::cadapter::throttle::ThrottleConfig;
use crate::chuck::chunk::ChunkLayout;
use crate::chuck::disk_cache::DiskCacheType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fs_id: u32,
    pub layout: ChunkLayout,
    pub inode_cache: InodeCacheConfig,
    pub disk_cache: DiskCacheConfig,
    pub object_store: ObjectStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InodeCacheConfig {
    /// Maximum number of resident inode records.
    pub capacity: usize,
    /// Period of the background dirty flush.
    pub flush_interval_secs: u64,
}

impl Default for InodeCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 65536,
            flush_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    pub cache_type: DiskCacheType,
    pub cache_dir: PathBuf,
    pub max_usable_space_bytes: u64,
    /// Percent of usage at which trimming starts.
    pub full_ratio: u32,
    /// Percent of usage trimming brings the cache back under.
    pub safe_ratio: u32,
    pub trim_check_interval_secs: u64,
    pub upload_queue_num: usize,
    pub upload_queue_depth: usize,
    /// Also consider the usage of the whole file system holding `cache_dir`.
    pub check_fs_usage: bool,
    pub throttle: ThrottleConfig,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tierfs")
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            cache_type: DiskCacheType::Disable,
            cache_dir: default_cache_dir(),
            max_usable_space_bytes: 10 * 1024 * 1024 * 1024,
            full_ratio: 90,
            safe_ratio: 70,
            trim_check_interval_secs: 5,
            upload_queue_num: 8,
            upload_queue_depth: 1024,
            check_fs_usage: true,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl DiskCacheConfig {
    pub fn trim_check_interval(&self) -> Duration {
        Duration::from_secs(self.trim_check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default = "default_region")]
        region: String,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            root: std::env::temp_dir().join("tierfs-objects"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub backend: BackendConfig,
    pub part_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub timeout_secs: u64,
    /// Cap on bytes held by in-flight asynchronous requests; 0 disables it.
    pub max_async_request_inflight_bytes: u64,
    pub throttle: ThrottleConfig,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        let s3 = S3Config::default();
        Self {
            backend: BackendConfig::default(),
            part_size: s3.part_size,
            max_concurrency: s3.max_concurrency,
            max_retries: s3.max_retries,
            initial_retry_delay_ms: s3.initial_retry_delay_ms,
            timeout_secs: s3.timeout.as_secs(),
            max_async_request_inflight_bytes: 0,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl ObjectStoreConfig {
    pub fn s3_config(&self) -> S3Config {
        S3Config {
            part_size: self.part_size,
            max_concurrency: self.max_concurrency,
            max_retries: self.max_retries,
            initial_retry_delay_ms: self.initial_retry_delay_ms,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.layout.is_valid() {
            return Err(ConfigError::Invalid(format!(
                "block size {} must be non-zero and divide chunk size {}",
                self.layout.block_size, self.layout.chunk_size
            )));
        }
        let dc = &self.disk_cache;
        if dc.full_ratio > 100 || dc.safe_ratio >= dc.full_ratio {
            return Err(ConfigError::Invalid(format!(
                "disk cache ratios must satisfy safe < full <= 100, got safe {} full {}",
                dc.safe_ratio, dc.full_ratio
            )));
        }
        if dc.upload_queue_num == 0 {
            return Err(ConfigError::Invalid(
                "disk cache needs at least one upload queue".into(),
            ));
        }
        if self.object_store.part_size == 0 {
            return Err(ConfigError::Invalid("object store part size is zero".into()));
        }
        Ok(())
    }
}

impl From<ConfigError> for crate::error::Error {
    fn from(e: ConfigError) -> Self {
        crate::error::Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.inode_cache.capacity, 65536);
        assert_eq!(cfg.disk_cache.full_ratio, 90);
        assert_eq!(cfg.disk_cache.safe_ratio, 70);
        assert_eq!(cfg.object_store.max_async_request_inflight_bytes, 0);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
fs_id: 3
layout:
  chunk_size: 1048576
  block_size: 65536
disk_cache:
  cache_type: read_write
  cache_dir: /var/cache/tierfs
  upload_queue_num: 2
  throttle:
    iops_write: 100
object_store:
  backend:
    type: s3
    bucket: data
    endpoint: http://127.0.0.1:9000
  max_async_request_inflight_bytes: 67108864
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.fs_id, 3);
        assert_eq!(cfg.layout.block_size, 65536);
        assert_eq!(cfg.disk_cache.cache_type, DiskCacheType::ReadWrite);
        assert_eq!(cfg.disk_cache.upload_queue_num, 2);
        assert_eq!(cfg.disk_cache.throttle.iops_write, 100);
        assert_eq!(cfg.disk_cache.full_ratio, 90);
        match &cfg.object_store.backend {
            BackendConfig::S3 { bucket, region, .. } => {
                assert_eq!(bucket, "data");
                assert_eq!(region, "us-east-1");
            }
            other => panic!("unexpected backend {other:?}"),
        }
        assert_eq!(cfg.inode_cache.flush_interval_secs, 5);
    }

    #[test]
    fn test_invalid_ratios_rejected() {
        let yaml = "disk_cache:\n  full_ratio: 60\n  safe_ratio: 60\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
        let yaml = "layout:\n  chunk_size: 1000\n  block_size: 300\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_yaml("fs_id: [1"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_yaml_round_trip_keeps_backend() {
        let cfg = Config::default();
        let text = cfg.to_yaml().unwrap();
        let back = Config::from_yaml(&text).unwrap();
        assert!(matches!(back.object_store.backend, BackendConfig::Local { .. }));
    }

    #[test]
    fn test_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tierfs.yml");
        std::fs::write(&path, "fs_id: 9\n").unwrap();
        assert_eq!(Config::from_file(&path).unwrap().fs_id, 9);
        assert!(matches!(
            Config::from_file(tmp.path().join("missing.yml")),
            Err(ConfigError::IoError(_))
        ));
    }
}
