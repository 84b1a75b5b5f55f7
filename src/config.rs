//! TOML configuration for the service endpoint, file drop and account.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    app_dirs::{self, AppDirError},
    http_client::HttpTimeouts,
    job::{DEFAULT_POLL_INTERVAL, DEFAULT_REMOTE_DIR, JobSettings},
    registry::atomic_write,
    remote_api::{ApiSettings, DEFAULT_HOST, PROTOCOL_VERSION},
    transfer::Transport,
};

/// Name of the config file inside the app directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config {path}: {source}")]
    SerializeToml {
        path: PathBuf,
        source: toml::ser::Error,
    },
    #[error("Transfer backend 'local' needs a drop_root")]
    MissingDropRoot,
    #[error(transparent)]
    AppDir(#[from] AppDirError),
}

/// Everything read from `config.toml`. Missing keys take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub account: AccountSettings,
    /// Scratch root for per-job files; defaults to `<app dir>/work`.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub protocol_version: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        let timeouts = HttpTimeouts::default();
        Self {
            scheme: "https".into(),
            host: DEFAULT_HOST.into(),
            path: "/api".into(),
            protocol_version: PROTOCOL_VERSION.into(),
            connect_timeout_secs: timeouts.connect.as_secs(),
            read_timeout_secs: timeouts.read.as_secs(),
            write_timeout_secs: timeouts.write.as_secs(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferBackend {
    #[default]
    Sftp,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub backend: TransferBackend,
    /// Drop host; the service host when unset.
    pub host: Option<String>,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub session_timeout_secs: u64,
    /// Directory standing in for the drop with the `local` backend.
    pub drop_root: Option<PathBuf>,
    /// Remote working directory; `{account}` becomes the account id.
    pub remote_dir: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            backend: TransferBackend::Sftp,
            host: None,
            port: 22,
            connect_timeout_ms: 3000,
            session_timeout_secs: 300,
            drop_root: None,
            remote_dir: DEFAULT_REMOTE_DIR.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSettings {
    pub username: Option<String>,
    pub account_id: Option<u32>,
}

impl AppConfig {
    pub fn api_settings(&self) -> ApiSettings {
        let service = &self.service;
        ApiSettings {
            scheme: service.scheme.clone(),
            host: service.host.clone(),
            path: service.path.clone(),
            protocol_version: service.protocol_version.clone(),
            timeouts: HttpTimeouts {
                connect: Duration::from_secs(service.connect_timeout_secs.max(1)),
                read: Duration::from_secs(service.read_timeout_secs.max(1)),
                write: Duration::from_secs(service.write_timeout_secs.max(1)),
            },
        }
    }

    pub fn transport(&self) -> Result<Transport, ConfigError> {
        let transfer = &self.transfer;
        match transfer.backend {
            TransferBackend::Sftp => Ok(Transport::Sftp {
                port: transfer.port,
                connect_timeout: Duration::from_millis(transfer.connect_timeout_ms),
                session_timeout: Duration::from_secs(transfer.session_timeout_secs),
            }),
            TransferBackend::Local => transfer
                .drop_root
                .clone()
                .map(|root| Transport::LocalDrop { root })
                .ok_or(ConfigError::MissingDropRoot),
        }
    }

    pub fn job_settings(&self) -> Result<JobSettings, ConfigError> {
        let work_root = match &self.work_dir {
            Some(dir) => dir.clone(),
            None => app_dirs::work_dir()?,
        };
        Ok(JobSettings {
            work_root,
            poll_interval: Duration::from_secs(self.service.poll_interval_secs.max(1)),
            transport: self.transport()?,
            transfer_host: self
                .transfer
                .host
                .clone()
                .unwrap_or_else(|| host_without_port(&self.service.host).to_string()),
            remote_dir: self.transfer.remote_dir.clone(),
        })
    }
}

fn host_without_port(host: &str) -> &str {
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(name, _)| name)
}

/// Resolve the configuration file path, ensuring the app directory exists.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(app_dirs::app_root_dir()?.join(CONFIG_FILE_NAME))
}

/// Load configuration from disk, returning defaults if missing.
pub fn load_or_default() -> Result<AppConfig, ConfigError> {
    load_from(&config_path()?)
}

pub fn load_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AppConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&text).map_err(|source| ConfigError::ParseToml {
        path: path.to_path_buf(),
        source,
    })
}

/// Persist configuration, overwriting any previous contents.
pub fn save(config: &AppConfig) -> Result<(), ConfigError> {
    save_to_path(config, &config_path()?)
}

/// Write the TOML file atomically so a crash never leaves half a config.
pub fn save_to_path(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    let data = toml::to_string_pretty(config).map_err(|source| ConfigError::SerializeToml {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, data.as_bytes()).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
