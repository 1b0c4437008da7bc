// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Settings for the download queue and its session store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Folder finished downloads land in.
    pub download_dir: PathBuf,
    pub database_path: PathBuf,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Minimum gap between progress writes to the session store, per session.
    pub progress_persist_interval_ms: u64,
    /// Capacity of the intercepted-request map.
    pub max_pending_requests: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            database_path: PathBuf::from("downloads").join("sessions.db"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout_secs: 10,
            progress_persist_interval_ms: 1000,
            max_pending_requests: 32,
        }
    }
}

impl QueueConfig {
    /// Reads a JSON config file. A missing file yields the defaults;
    /// absent keys fall back to their default values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Places both the downloads and the session database under `dir`.
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            database_path: dir.join("sessions.db"),
            download_dir: dir,
            ..Self::default()
        }
    }

    pub fn progress_persist_interval(&self) -> Duration {
        Duration::from_millis(self.progress_persist_interval_ms)
    }

    /// The client every HTTP transfer shares.
    pub fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .build()?;
        Ok(client)
    }
}
