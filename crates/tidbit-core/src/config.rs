//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tidbit/config.toml)
//! 3. Environment variables (TIDBIT_* prefix)
//!
//! Environment variables take precedence over config file values. The
//! binary applies its command-line flags on top of the loaded result.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "TIDBIT";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Storage backend name (`redb`, `sqlite`, or `flatfile`)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Backend data source; derived from `data_dir` when unset
    #[serde(default)]
    pub data_source: Option<PathBuf>,

    /// Address the HTTP server listens on
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Password for HTTP Basic authentication; open access when unset
    #[serde(default)]
    pub password: Option<String>,

    /// User name accepted together with `password`
    #[serde(default = "default_username")]
    pub username: String,

    /// Index page served at `/`
    #[serde(default)]
    pub index_path: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: default_backend(),
            data_source: None,
            http_addr: default_http_addr(),
            password: None,
            username: default_username(),
            index_path: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TIDBIT_DATA_DIR, TIDBIT_BACKEND, ...)
    /// 2. Config file (~/.config/tidbit/config.toml or TIDBIT_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_BACKEND", ENV_PREFIX)) {
            if !val.is_empty() {
                self.backend = val;
            }
        }

        // Empty string clears it
        if let Ok(val) = std::env::var(format!("{}_DATA_SOURCE", ENV_PREFIX)) {
            self.data_source = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = std::env::var(format!("{}_HTTP_ADDR", ENV_PREFIX)) {
            if !val.is_empty() {
                self.http_addr = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_PASSWORD", ENV_PREFIX)) {
            self.password = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Ensure data directory exists
    pub fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TIDBIT_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tidbit")
            .join("config.toml")
    }

    /// The data source handed to the selected backend
    ///
    /// An explicit `data_source` wins; otherwise each backend gets its own
    /// default under `data_dir`.
    pub fn data_source_path(&self) -> PathBuf {
        if let Some(source) = &self.data_source {
            return source.clone();
        }
        match self.backend.as_str() {
            "sqlite" => self.data_dir.join("tidbit.db"),
            "flatfile" => self.data_dir.join("store"),
            _ => self.data_dir.join("tidbit.redb"),
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tidbit")
}

fn default_backend() -> String {
    "redb".to_string()
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_username() -> String {
    "tidbit".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
