//! Configuration for render workers and the clients that drive them.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CINERENDER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cinerender/config.toml
//!   3. $HOME/.config/cinerender/config.toml
//!
//! With none of those variables set there is no config file: defaults and
//! environment overrides apply, and nothing is written.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::{DEFAULT_PORT, DEFAULT_TIMEOUT_SECS};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CineRenderConfig {
    pub network: NetworkConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the worker listens on.
    pub listen_address: String,
    /// TCP port for render jobs. 0 = OS-assigned.
    pub port: u16,
    /// Deadline for establishing a connection.
    pub connect_timeout_secs: u64,
    /// Deadline for each blocking read or write.
    pub io_timeout_secs: u64,
    /// SO_SNDBUF in bytes. 0 = OS default.
    pub send_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Max connections served at once. 0 = number of CPUs.
    pub max_connections: usize,
    /// Largest job metadata block accepted.
    pub max_header_bytes: usize,
    /// Largest encoded frame accepted in a result.
    pub max_frame_bytes: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: 5,
            io_timeout_secs: DEFAULT_TIMEOUT_SECS,
            send_buffer_size: 0,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_header_bytes: 1 << 20, // 1 MiB
            max_frame_bytes: 256 << 20, // 256 MiB
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// `listen_address:port`, suitable for binding.
    pub fn listen_endpoint(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}

impl WorkerConfig {
    /// `max_connections` with 0 resolved to the available parallelism.
    pub fn connection_limit(&self) -> usize {
        if self.max_connections > 0 {
            return self.max_connections;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

/// Unset and empty variables are treated alike.
fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn resolve_file_path(
    explicit: Option<PathBuf>,
    xdg_config_home: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    xdg_config_home
        .or_else(|| home.map(|h| h.join(".config")))
        .map(|dir| dir.join("cinerender").join("config.toml"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CineRenderConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::file_path() {
            Some(path) => Self::load_from(&path),
            None => {
                let mut config = CineRenderConfig::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    /// Load from an explicit path, falling back to defaults if it does not
    /// exist. Env overrides still apply.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            CineRenderConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path, if the environment names a place for one.
    pub fn file_path() -> Option<PathBuf> {
        resolve_file_path(
            env_path("CINERENDER_CONFIG"),
            env_path("XDG_CONFIG_HOME"),
            env_path("HOME"),
        )
    }

    /// Write the default config to `path` unless a file is already there.
    /// Returns whether a file was written.
    pub fn write_default_to(path: &Path) -> Result<bool, ConfigError> {
        if path.exists() {
            return Ok(false);
        }
        let write_failed = |e| ConfigError::WriteFailed(path.to_path_buf(), e);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_failed)?;
        }
        let text = toml::to_string_pretty(&CineRenderConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(write_failed)?;
        Ok(true)
    }

    /// Apply CINERENDER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CINERENDER_NETWORK__LISTEN_ADDRESS") {
            self.network.listen_address = v;
        }
        if let Ok(v) = std::env::var("CINERENDER_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("CINERENDER_NETWORK__IO_TIMEOUT_SECS") {
            if let Ok(s) = v.parse() {
                self.network.io_timeout_secs = s;
            }
        }
        if let Ok(v) = std::env::var("CINERENDER_NETWORK__CONNECT_TIMEOUT_SECS") {
            if let Ok(s) = v.parse() {
                self.network.connect_timeout_secs = s;
            }
        }
        if let Ok(v) = std::env::var("CINERENDER_WORKER__MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.worker.max_connections = n;
            }
        }
    }
}
