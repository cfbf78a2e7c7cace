//! Configuration for the weft server.
//!
//! Read from `$WEFT_CONFIG` if set, else `~/.weft/config.toml`. Every section
//! is optional; a missing file means defaults throughout.
//!
//! ```toml
//! [server]
//! interface = "127.0.0.1"
//! port = 7788
//!
//! [log]
//! filter = "weft=debug"
//! file = "${HOME}/.weft/weft.log"
//! ```

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_INTERFACE: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 7788;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "WEFT_CONFIG";

#[derive(Debug, Default, Deserialize)]
pub struct WeftConfig {
    pub server: Option<ServerConfig>,
    pub log: Option<LogConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_owned()
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on. Default: all interfaces.
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// `interface:port`, suitable for `ToSocketAddrs`.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        if self.interface.contains(':') {
            format!("[{}]:{}", self.interface, self.port)
        } else {
            format!("{}:{}", self.interface, self.port)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    /// Log file; stderr when absent.
    pub file: Option<PathBuf>,
}

/// Replace `${VAR}` with the variable's value. Unset variables become empty;
/// an unclosed `${` is kept as written.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + len];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + len + 1..];
    }

    out.push_str(rest);
    out
}

impl WeftConfig {
    /// Load the config file, if there is one.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file");
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Load and parse `path`, expanding `${VAR}` references.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        config.expand();
        Ok(config)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// The `[server]` section, defaulted.
    #[must_use]
    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    /// The `[log]` section, defaulted.
    #[must_use]
    pub fn log(&self) -> LogConfig {
        self.log.clone().unwrap_or_default()
    }

    fn expand(&mut self) {
        if let Some(server) = &mut self.server {
            server.interface = expand_env_vars(&server.interface);
        }
        if let Some(log) = &mut self.log {
            log.filter = log.filter.as_deref().map(expand_env_vars);
            log.file = log
                .file
                .as_deref()
                .map(|file| PathBuf::from(expand_env_vars(&file.to_string_lossy())));
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|path| !path.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".weft").join("config.toml"))
}
