//! Configuration types and builders.

mod tools_file;

pub use tools_file::ToolsConfig;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the fallback connection string.
pub const CONNECTION_STRING_ENV: &str = "POSTGRES_CONNECTION_STRING";

/// Environment variable naming the tool enablement file.
pub const TOOLS_CONFIG_ENV: &str = "POSTGRES_TOOLS_CONFIG";

/// Settings applied to every pool the connection manager creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub max_size: usize,
    pub connect_timeout: Duration,
    /// Server-side `statement_timeout` set on every new connection.
    pub statement_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            connect_timeout: Duration::from_secs(30),
            statement_timeout: None,
        }
    }
}

impl PoolSettings {
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size.max(1);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub pool: PoolSettings,
    /// Connection string given on the command line.
    pub default_connection_string: Option<String>,
    /// Connection string read from [`CONNECTION_STRING_ENV`].
    pub env_connection_string: Option<String>,
    pub tools_config: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            pool: PoolSettings::default(),
            default_connection_string: None,
            env_connection_string: None,
            tools_config: None,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for ServerConfig.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn pool(mut self, pool: PoolSettings) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn default_connection_string(mut self, conn: Option<String>) -> Self {
        self.config.default_connection_string = non_blank(conn);
        self
    }

    pub fn env_connection_string(mut self, conn: Option<String>) -> Self {
        self.config.env_connection_string = non_blank(conn);
        self
    }

    /// Reads [`CONNECTION_STRING_ENV`] from the process environment.
    pub fn from_env(self) -> Self {
        let conn = std::env::var(CONNECTION_STRING_ENV).ok();
        self.env_connection_string(conn)
    }

    pub fn tools_config(mut self, path: Option<PathBuf>) -> Self {
        self.config.tools_config = path;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
