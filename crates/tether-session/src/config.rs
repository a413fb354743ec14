use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_protocol::{Kind, MAX_LINE_BYTES};
use thiserror::Error;

use crate::transport::{Endpoint, InvalidEndpoint};

/// Environment variable naming the backend endpoint.
pub const ENDPOINT_ENV: &str = "TETHER_ENDPOINT";

/// Per-connection tuning. Every field has a default, so an empty TOML table
/// (or no table at all) is a valid configuration.
///
/// Timeouts are in milliseconds; `0` disables the deadline for that kind of
/// request.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub chat_timeout_ms: u64,
    pub edit_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Cancel and approval acknowledgements.
    pub control_timeout_ms: u64,
    pub max_line_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chat_timeout_ms: 120_000,
            edit_timeout_ms: 30_000,
            command_timeout_ms: 300_000,
            control_timeout_ms: 10_000,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

impl SessionConfig {
    /// Deadline for a request whose reply has kind `expected`.
    pub fn timeout_for(&self, expected: &Kind) -> Option<Duration> {
        let ms = match expected {
            Kind::ChatResponse => self.chat_timeout_ms,
            Kind::FileEdited => self.edit_timeout_ms,
            Kind::CommandOutput => self.command_timeout_ms,
            _ => self.control_timeout_ms,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Endpoint(#[from] InvalidEndpoint),
}

/// Client-side settings shared by the binaries, read from
/// `$XDG_CONFIG_HOME/tether/config.toml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: Option<String>,
    pub session: SessionConfig,
}

impl ClientConfig {
    /// Load from `path`, or from the default location. A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(tether_protocol::paths::config_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Pick the endpoint: flag, then environment, then config file, then
    /// the default socket.
    pub fn resolve_endpoint(
        &self,
        flag: Option<&str>,
        env: Option<&str>,
    ) -> Result<Endpoint, ConfigError> {
        let chosen = flag
            .or(env)
            .or(self.endpoint.as_deref())
            .filter(|s| !s.trim().is_empty());
        match chosen {
            Some(s) => Ok(s.parse()?),
            None => Ok(Endpoint::Unix(tether_protocol::paths::default_socket_path())),
        }
    }
}
