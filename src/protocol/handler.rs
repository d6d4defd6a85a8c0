//! Request handler and method dispatcher.

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::types::*;
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Handler trait for processing MCP requests.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle initialize request.
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult>;

    /// Handle initialized notification.
    async fn initialized(&self) -> ProtocolResult<()>;

    /// Release resources. The server calls this once, after in-flight calls drained.
    async fn shutdown(&self) -> ProtocolResult<()>;

    /// List available tools.
    async fn list_tools(&self) -> ProtocolResult<ListToolsResult>;

    /// Call a tool.
    async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult>;

    /// Handle ping request.
    async fn ping(&self) -> ProtocolResult<Value> {
        Ok(serde_json::json!({}))
    }
}

/// Method dispatcher that routes requests to appropriate handlers.
pub struct Dispatcher<H: Handler> {
    handler: Arc<H>,
    capabilities: Option<ServerCapabilities>,
}

impl<H: Handler> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            capabilities: self.capabilities.clone(),
        }
    }
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            capabilities: None,
        }
    }

    /// Announces `capabilities` in every `initialize` reply in place of the handler's.
    pub fn advertising(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    fn announce(&self, mut result: InitializeResult) -> InitializeResult {
        if let Some(capabilities) = &self.capabilities {
            result.capabilities = capabilities.clone();
        }
        result
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Dispatch a request to the appropriate handler method.
    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!("Dispatching request: {}", request.method);

        let result = match request.method.as_str() {
            "initialize" => match params::<InitializeParams>(request.params) {
                Ok(params) => encode(
                    self.handler
                        .initialize(params)
                        .await
                        .map(|result| self.announce(result)),
                ),
                Err(e) => Err(e),
            },
            "initialized" | "notifications/initialized" => {
                self.handler.initialized().await.map(|()| Value::Null)
            }
            // Acknowledged here; the server loop stops and runs the handler's shutdown.
            "shutdown" | "notifications/cancelled" => Ok(Value::Null),
            "ping" => self.handler.ping().await,
            "tools/list" => encode(self.handler.list_tools().await),
            "tools/call" => match params::<CallToolParams>(request.params) {
                Ok(params) => encode(self.handler.call_tool(params).await),
                Err(e) => Err(e),
            },
            method => {
                warn!("Unknown method: {}", method);
                Err(ProtocolError::MethodNotFound(method.to_string()))
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => {
                error!("Request failed: {}", e);
                JsonRpcResponse::error(request.id, e)
            }
        }
    }
}

/// Decodes required request params.
fn params<T: DeserializeOwned>(params: Option<Value>) -> ProtocolResult<T> {
    let params = params.ok_or_else(|| ProtocolError::InvalidParams("Missing params".into()))?;
    serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string().into()))
}

fn encode<T: Serialize>(result: ProtocolResult<T>) -> ProtocolResult<Value> {
    serde_json::to_value(result?).map_err(|e| ProtocolError::InternalError(e.to_string().into()))
}
