//! MCP request handler implementation.

use crate::error::ProtocolResult;
use crate::protocol::{
    CallToolParams, CallToolResult, Handler, InitializeParams, InitializeResult, ListToolsResult,
    MCP_VERSION, ServerCapabilities, ServerInfo,
};
use crate::server::state::ServerState;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// MCP request handler that processes protocol messages.
pub struct McpHandler {
    state: Arc<ServerState>,
}

impl McpHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    fn instructions(&self) -> String {
        let names: Vec<String> = self
            .state
            .tools
            .list_tools()
            .into_iter()
            .map(|tool| tool.name)
            .collect();

        let connection = if self.state.has_default_connection() {
            "A default connection string is configured; 'connectionString' may be omitted."
        } else {
            "No default connection string is configured; pass 'connectionString' with every call."
        };

        format!(
            "PostgreSQL administration server. Wide tools select their action with an \
            'operation' argument (pg_analyze_database uses 'analysisType', pg_debug_database \
            uses 'issue'). {} Enabled tools: {}.",
            connection,
            names.join(", ")
        )
    }
}

#[async_trait]
impl Handler for McpHandler {
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult> {
        info!(
            "Initialize request from {} v{}",
            params.client_info.name, params.client_info.version
        );
        debug!("Client capabilities: {:?}", params.capabilities);

        self.state.set_initialized(params.client_info);

        Ok(InitializeResult {
            protocol_version: MCP_VERSION.into(),
            // McpServerBuilder::with_tools decides what is announced
            capabilities: ServerCapabilities::default(),
            server_info: ServerInfo {
                name: self.state.config.name.to_string(),
                version: self.state.config.version.to_string(),
            },
            instructions: Some(self.instructions()),
        })
    }

    async fn initialized(&self) -> ProtocolResult<()> {
        info!("Server initialized successfully");
        Ok(())
    }

    async fn shutdown(&self) -> ProtocolResult<()> {
        let closed = self.state.connections.cleanup_all();
        info!(
            "Shutdown complete after {} tool call(s); {} pool(s) closed",
            self.state.call_count(),
            closed
        );
        Ok(())
    }

    async fn list_tools(&self) -> ProtocolResult<ListToolsResult> {
        let tools = self.state.tools.list_tools();
        debug!("Listing {} tools", tools.len());

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    /// Tool failures are reported inside the result, never as protocol errors.
    async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult> {
        self.state.record_call();
        debug!("Tool call: {}", params.name);

        Ok(self
            .state
            .tools
            .call_tool(&params.name, params.arguments, self.state.context())
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::ClientInfo;
    use crate::server::ServerStateBuilder;
    use serde_json::json;

    fn handler() -> McpHandler {
        let state = ServerStateBuilder::new()
            .config(ServerConfig::default())
            .build()
            .unwrap();
        McpHandler::new(Arc::new(state))
    }

    #[tokio::test]
    async fn test_initialize_lists_enabled_tools() {
        let handler = handler();
        handler.state().tools.apply_filter(Some(&["pg_execute_sql".to_string()]));

        let result = handler
            .initialize(InitializeParams {
                protocol_version: MCP_VERSION.into(),
                capabilities: Default::default(),
                client_info: ClientInfo {
                    name: "test".into(),
                    version: "1.0".into(),
                },
            })
            .await
            .unwrap();

        let instructions = result.instructions.unwrap();
        assert!(instructions.contains("Enabled tools: pg_execute_sql."));
        assert!(handler.state().is_initialized());
    }

    #[tokio::test]
    async fn test_tool_failure_is_not_a_protocol_error() {
        let handler = handler();
        let result = handler
            .call_tool(CallToolParams {
                name: "pg_manage_functions".into(),
                arguments: json!({"operation": "launch"}),
            })
            .await
            .unwrap();

        assert!(result.is_error());
        assert!(result.text_content().starts_with("UnknownOperation:"));
        assert_eq!(handler.state().call_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_repeatable() {
        let handler = handler();
        handler.shutdown().await.unwrap();
        handler.shutdown().await.unwrap();
        assert_eq!(handler.state().connections.pool_count(), 0);
    }
}
