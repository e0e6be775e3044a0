//! Mount configuration.
//!
//! Loaded from TOML. Everything except `mount_point` and `state_dir` has a
//! default:
//!
//! ```toml
//! mount_point = "/mnt/tessera"
//! state_dir = "/var/lib/tessera"
//! max_chunk_size = 20971520
//! max_file_chunks = 65536
//! fan_out = 4
//!
//! [owner]
//! uid = 1000
//! gid = 1000
//!
//! [remote]
//! credentials = "token"
//! target = "archive"
//!
//! [retry]
//! max_attempts = 5
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tessera_types::Owner;

use crate::blob::RetryPolicy;
use crate::engine::EngineConfig;
use crate::reclaim::ReclaimConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Opaque adapter settings, forwarded untouched.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("target", &self.target)
            .finish()
    }
}

fn default_max_chunk_size() -> u32 {
    20 * 1024 * 1024
}

fn default_cache_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_max_file_chunks() -> u32 {
    65536
}

fn default_fan_out() -> usize {
    4
}

fn default_shutdown_deadline_secs() -> u64 {
    30
}

fn default_reclaim_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesseraConfig {
    /// Kernel mount target, handed to the bridge.
    pub mount_point: PathBuf,
    /// Holds `index.db` and `pointer.db`.
    pub state_dir: PathBuf,
    #[serde(default)]
    pub owner: Owner,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u32,
    /// Largest file, in units of `max_chunk_size`.
    #[serde(default = "default_max_file_chunks")]
    pub max_file_chunks: u32,
    /// Resident-chunk cache budget; 0 disables caching.
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: usize,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
}

impl TesseraConfig {
    /// Defaults for everything but the two required paths.
    pub fn new(mount_point: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            state_dir: state_dir.into(),
            owner: Owner::default(),
            remote: RemoteConfig::default(),
            max_chunk_size: default_max_chunk_size(),
            max_file_chunks: default_max_file_chunks(),
            cache_bytes: default_cache_bytes(),
            sync_interval_secs: default_sync_interval_secs(),
            fan_out: default_fan_out(),
            retry: RetryPolicy::default(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
        }
    }

    /// Parse and validate.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_size == 0 {
            return Err(ConfigError::Invalid("max_chunk_size must be > 0".into()));
        }
        if self.max_file_chunks == 0 {
            return Err(ConfigError::Invalid("max_file_chunks must be > 0".into()));
        }
        if self.fan_out == 0 {
            return Err(ConfigError::Invalid("fan_out must be >= 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("sync_interval_secs must be > 0".into()));
        }
        if self.reclaim_interval_secs == 0 {
            return Err(ConfigError::Invalid("reclaim_interval_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.state_dir.join("index.db")
    }

    pub fn pointer_db_path(&self) -> PathBuf {
        self.state_dir.join("pointer.db")
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_chunk_size: self.max_chunk_size,
            max_file_chunks: self.max_file_chunks,
            fan_out: self.fan_out,
            cache_bytes: self.cache_bytes,
            owner: self.owner,
        }
    }

    pub fn reclaim_config(&self) -> ReclaimConfig {
        ReclaimConfig {
            interval: Duration::from_secs(self.reclaim_interval_secs),
            fan_out: self.fan_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = TesseraConfig::from_toml_str(
            r#"
            mount_point = "/mnt/t"
            state_dir = "/tmp/t"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_chunk_size, 20 * 1024 * 1024);
        assert_eq!(config.fan_out, 4);
        assert_eq!(config.engine_config().max_file_size(), 20 * 1024 * 1024 * 65536);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.sync_interval(), Duration::from_secs(300));
        assert_eq!(config.index_db_path(), PathBuf::from("/tmp/t/index.db"));
    }

    #[test]
    fn test_full_config() {
        let config = TesseraConfig::from_toml_str(
            r#"
            mount_point = "/mnt/t"
            state_dir = "/tmp/t"
            max_chunk_size = 1024
            cache_bytes = 0
            fan_out = 1

            [owner]
            uid = 1000
            gid = 100

            [remote]
            credentials = "hunter2"
            target = "vault"

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.owner, Owner::new(1000, 100));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 50);
        assert_eq!(config.engine_config().fan_out, 1);

        let debug = format!("{:?}", config.remote);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("vault"));
    }

    #[test]
    fn test_validation() {
        let err = TesseraConfig::from_toml_str(
            r#"
            mount_point = "/m"
            state_dir = "/s"
            fan_out = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        assert!(matches!(
            TesseraConfig::from_toml_str("state_dir = \"/s\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");
        std::fs::write(&path, "mount_point = \"/m\"\nstate_dir = \"/s\"\n").unwrap();
        assert_eq!(TesseraConfig::load(&path).unwrap().mount_point, PathBuf::from("/m"));
        assert!(matches!(
            TesseraConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
