// Configuration loading for wecare-sync.
// Reads TOML from `--config <path>` or `WECARE_CONFIG`; every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub api_base_url: String,
    pub refresh_path: String,
    pub request_timeout_ms: u64,
    pub log_level: String,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory of the durable store; platform cache dir when unset.
    pub dir: Option<PathBuf>,
    pub prefix: String,
    pub max_bytes: usize,
    pub default_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub token_check_interval_ms: u64,
    pub expiry_buffer_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            refresh_path: "/api/auth/refresh".to_string(),
            request_timeout_ms: 30_000,
            log_level: "info".to_string(),
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            prefix: crate::cache::DEFAULT_PREFIX.to_string(),
            max_bytes: crate::cache::DEFAULT_MAX_BYTES,
            default_ttl_ms: crate::cache::DEFAULT_TTL.as_millis() as u64,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_check_interval_ms: 4 * 60 * 1000,
            expiry_buffer_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("No cache directory available; set cache.dir")]
    NoCacheDir,
}

impl Config {
    /// Load from the path given on the command line or in the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match config_path_from_args().or_else(config_path_from_env) {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.refresh_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "refresh_path",
                reason: "must start with '/'".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cache.prefix",
                reason: "must not be empty".to_string(),
            });
        }
        if self.cache.max_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_bytes",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.default_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.default_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.auth.token_check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "auth.token_check_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.default_ttl_ms)
    }

    pub fn token_check_interval(&self) -> Duration {
        Duration::from_millis(self.auth.token_check_interval_ms)
    }

    pub fn expiry_buffer(&self) -> Duration {
        Duration::from_millis(self.auth.expiry_buffer_ms)
    }

    /// Directory for the durable store.
    pub fn store_dir(&self) -> Result<PathBuf, ConfigError> {
        self.cache
            .dir
            .clone()
            .or_else(paths::store_dir)
            .ok_or(ConfigError::NoCacheDir)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("WECARE_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.token_check_interval(), Duration::from_secs(240));
        assert_eq!(config.expiry_buffer(), Duration::from_secs(300));
        assert_eq!(config.cache.max_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            api_base_url = "https://api.wecare.example"

            [cache]
            max_bytes = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.api_base_url, "https://api.wecare.example");
        assert_eq!(config.cache.max_bytes, 1024);
        assert_eq!(config.cache.prefix, "wecare_cache_");
        assert_eq!(config.refresh_path, "/api/auth/refresh");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = Config::from_toml("api_url = \"x\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_errors() {
        let config = Config {
            request_timeout_ms: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                ..
            })
        ));

        let config = Config {
            refresh_path: "api/auth/refresh".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_path_and_store_dir() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("wecare.toml");
        let store = temp_dir.path().join("store");
        std::fs::write(
            &path,
            format!("[cache]\ndir = {:?}\n", store.to_str().unwrap()),
        )
        .unwrap();

        let config = Config::from_path(&path).unwrap();
        assert_eq!(config.store_dir().unwrap(), store);
    }
}
