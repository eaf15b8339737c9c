//! Server configuration
//!
//! Loaded from a TOML file. Every section and key is optional; missing values
//! fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub communication: CommunicationSection,
    pub thread_pool: ThreadPoolSection,
    pub logging: LoggingSection,
    pub tls: TlsSection,
}

/// Identity and listening address
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    /// Host name the server answers for
    pub name: String,
    /// Name shown to clients in the greeting and farewell
    pub display_name: String,
    pub address: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            display_name: crate::session::DEFAULT_SERVER_NAME.to_string(),
            address: "127.0.0.1".to_string(),
            port: 1143,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CommunicationSection {
    /// Seconds a client may stay silent before the connection is dropped
    pub socket_timeout: u64,
}

impl Default for CommunicationSection {
    fn default() -> Self {
        Self { socket_timeout: 300 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ThreadPoolSection {
    pub max_working_threads: usize,
    /// Upper bound on connections served at the same time
    pub max_sessions: usize,
}

impl Default for ThreadPoolSection {
    fn default() -> Self {
        Self {
            max_working_threads: 4,
            max_sessions: 256,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// PEM files used for STARTTLS
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TlsSection {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            certificate: PathBuf::from("tls/cert.pem"),
            private_key: PathBuf::from("tls/key.pem"),
        }
    }
}

impl ServerConfig {
    /// Read and validate the configuration file at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&text)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.communication.socket_timeout == 0 {
            return Err(Error::Config(
                "communication.socket_timeout must be greater than zero".to_string(),
            ));
        }
        if self.thread_pool.max_working_threads == 0 {
            return Err(Error::Config(
                "thread_pool.max_working_threads must be greater than zero".to_string(),
            ));
        }
        if self.thread_pool.max_sessions == 0 {
            return Err(Error::Config(
                "thread_pool.max_sessions must be greater than zero".to_string(),
            ));
        }
        self.log_level()?;
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.address, self.server.port)
            .parse()
            .map_err(|e| {
                Error::Config(format!(
                    "Invalid listen address {}:{}: {}",
                    self.server.address, self.server.port, e
                ))
            })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.communication.socket_timeout)
    }

    pub fn log_level(&self) -> Result<log::LevelFilter> {
        self.logging
            .level
            .parse()
            .map_err(|_| Error::Config(format!("Unknown log level: {}", self.logging.level)))
    }
}
