//! Server state management.

use crate::config::{ServerConfig, ToolsConfig};
use crate::database::{ConnectionManager, ConnectionResolver};
use crate::error::ConfigError;
use crate::protocol::ClientInfo;
use crate::tools::{ToolContext, ToolHandler, ToolRegistry, all_tools};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

pub struct ServerState {
    pub config: ServerConfig,
    pub connections: Arc<ConnectionManager>,
    pub tools: ToolRegistry,
    ctx: ToolContext,
    initialized: AtomicBool,
    client_info: RwLock<Option<ClientInfo>>,
    call_count: AtomicU64,
}

impl ServerState {
    pub fn new(config: ServerConfig, connections: Arc<ConnectionManager>, tools: ToolRegistry) -> Self {
        let resolver = ConnectionResolver::new(
            config.default_connection_string.clone(),
            config.env_connection_string.clone(),
        );
        let ctx = ToolContext::new(Arc::clone(&connections), resolver);
        Self {
            config,
            connections,
            tools,
            ctx,
            initialized: AtomicBool::new(false),
            client_info: RwLock::new(None),
            call_count: AtomicU64::new(0),
        }
    }

    /// What every tool call runs with.
    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_initialized(&self, client_info: ClientInfo) {
        *self.client_info.write() = Some(client_info);
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn client_info(&self) -> Option<ClientInfo> {
        self.client_info.read().clone()
    }

    pub fn record_call(&self) -> u64 {
        self.call_count.fetch_add(1, Ordering::SeqCst)
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn has_default_connection(&self) -> bool {
        self.ctx.resolver().has_default()
    }
}

pub struct ServerStateBuilder {
    config: Option<ServerConfig>,
    connections: Option<Arc<ConnectionManager>>,
    tools: Option<Vec<Arc<dyn ToolHandler>>>,
}

impl ServerStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            connections: None,
            tools: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn connections(mut self, connections: Arc<ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Replaces the shipped tool set.
    pub fn tools(mut self, tools: Vec<Arc<dyn ToolHandler>>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Assembles the registry and applies the enablement file named in the config, if any.
    pub fn build(self) -> Result<ServerState, ConfigError> {
        let config = self.config.unwrap_or_default();
        let connections = self
            .connections
            .unwrap_or_else(|| Arc::new(ConnectionManager::new(config.pool.clone())));

        let registry = ToolRegistry::new(self.tools.unwrap_or_else(all_tools))?;
        if let Some(path) = &config.tools_config {
            let allow_list = ToolsConfig::load(path);
            registry.apply_filter(allow_list.as_deref());
        }
        info!(
            "Registry assembled: {} of {} tools enabled",
            registry.enabled_count(),
            registry.len()
        );

        Ok(ServerState::new(config, connections, registry))
    }
}

impl Default for ServerStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_enable_every_tool() {
        let state = ServerStateBuilder::new().build().unwrap();
        assert_eq!(state.tools.len(), 15);
        assert_eq!(state.tools.enabled_count(), 15);
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_tools_config_narrows_enabled_set() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"enabledTools": ["pg_manage_users", "pg_not_a_tool"]}}"#).unwrap();

        let config = ServerConfig::builder()
            .tools_config(Some(file.path().to_path_buf()))
            .build();
        let state = ServerStateBuilder::new().config(config).build().unwrap();
        assert_eq!(state.tools.enabled_count(), 1);
        assert!(state.tools.is_enabled("pg_manage_users"));
        assert_eq!(state.tools.len(), 15);
    }

    #[test]
    fn test_malformed_tools_config_enables_everything() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let config = ServerConfig::builder()
            .tools_config(Some(file.path().to_path_buf()))
            .build();
        let state = ServerStateBuilder::new().config(config).build().unwrap();
        assert_eq!(state.tools.enabled_count(), 15);
    }

    #[test]
    fn test_default_connection_comes_from_config() {
        let config = ServerConfig::builder()
            .default_connection_string(Some("postgres://localhost/app".into()))
            .build();
        let state = ServerStateBuilder::new().config(config).build().unwrap();
        assert!(state.has_default_connection());
        assert_eq!(
            state.context().resolver().resolve(None).unwrap(),
            "postgres://localhost/app"
        );
    }
}
